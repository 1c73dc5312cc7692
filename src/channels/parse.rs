//! Raw RFC 5322 message → triage `Message`.
//!
//! `mail-parser` handles headers and MIME bodies; this module only picks
//! what triage needs out of them.

use chrono::{DateTime, Utc};
use mail_parser::MessageParser;
use uuid::Uuid;

use crate::pipeline::types::{Message, normalize_address};

/// Snippet length in characters.
const SNIPPET_CHARS: usize = 200;

/// Build a triage message from a raw RFC 822 blob fetched under `id`.
///
/// Returns `None` when the bytes are not a parseable message.
pub fn parse_message(id: &str, raw: &[u8]) -> Option<Message> {
    let parsed = MessageParser::default().parse(raw)?;

    let from = parsed.from().and_then(|addr| addr.first());
    let sender = from
        .and_then(|a| a.address())
        .map(normalize_address)
        .unwrap_or_else(|| "unknown".into());
    let sender_name = from
        .and_then(|a| a.name())
        .map(|n| n.trim().to_string())
        .filter(|n| !n.is_empty());

    let subject = parsed.subject().unwrap_or_default().trim().to_string();

    let body = if let Some(text) = parsed.body_text(0) {
        text.to_string()
    } else if let Some(html) = parsed.body_html(0) {
        strip_html(html.as_ref())
    } else {
        String::new()
    };

    let thread_id = thread_id(&parsed).unwrap_or_else(|| format!("gen-{}", Uuid::new_v4()));

    let received_at = parsed
        .date()
        .and_then(|d| DateTime::<Utc>::from_timestamp(d.to_timestamp(), 0))
        .unwrap_or_else(Utc::now);

    Some(Message {
        id: id.to_string(),
        sender,
        sender_name,
        subject,
        snippet: snippet(&body),
        thread_id,
        received_at,
        has_unsubscribe: !parsed.list_unsubscribe().is_empty(),
        disposition: None,
    })
}

/// Thread id: first `References` id, else `In-Reply-To`, else own id.
fn thread_id(parsed: &mail_parser::Message<'_>) -> Option<String> {
    [parsed.references(), parsed.in_reply_to()]
        .into_iter()
        .find_map(|h| h.as_text_list().and_then(|ids| ids.first()))
        .map(|id| id.trim().to_string())
        .or_else(|| parsed.message_id().map(str::to_string))
        .filter(|id| !id.is_empty())
}

/// Quote-stripped, whitespace-collapsed opening of the body.
pub fn snippet(body: &str) -> String {
    let text = strip_quoted_text(body);
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() <= SNIPPET_CHARS {
        collapsed
    } else {
        let cut: String = collapsed.chars().take(SNIPPET_CHARS).collect();
        format!("{}...", cut.trim_end())
    }
}

/// Strip HTML tags (basic).
pub fn strip_html(html: &str) -> String {
    let mut result = String::new();
    let mut in_tag = false;
    for ch in html.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => result.push(ch),
            _ => {}
        }
    }
    result.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Drop quoted reply lines and everything after an attribution line.
pub fn strip_quoted_text(body: &str) -> String {
    let mut result = Vec::new();
    for line in body.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with('>') {
            continue;
        }
        // "On Mon, Jan 1, 2026 at 10:00 AM Alice <alice@ex.com> wrote:"
        if trimmed.starts_with("On ") && trimmed.ends_with("wrote:") {
            break;
        }
        if trimmed.starts_with("---") && trimmed.contains("Original Message") {
            break;
        }
        result.push(line);
    }
    while result.last().is_some_and(|l| l.trim().is_empty()) {
        result.pop();
    }
    result.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    const NEWSLETTER: &str = "From: Shop & Co <Deals@Shop.com>\r\n\
To: me@example.com\r\n\
Subject: Weekend sale\r\n\
Date: Sat, 07 Mar 2026 09:30:00 +0000\r\n\
Message-ID: <abc123@shop.com>\r\n\
List-Unsubscribe: <https://shop.com/unsub>\r\n\
\r\n\
Everything is 50% off this weekend.\r\n";

    const REPLY: &str = "From: alice@example.com\r\n\
Subject: Re: Lunch\r\n\
Message-ID: <r2@example.com>\r\n\
In-Reply-To: <r1@example.com>\r\n\
References: <root@example.com>\r\n\
\x20<r1@example.com>\r\n\
\r\n\
Sure, noon works.\r\n\
\r\n\
On Fri, Mar 6, 2026 at 10:00 AM Bob <bob@example.com> wrote:\r\n\
> Lunch tomorrow?\r\n";

    #[test]
    fn parses_newsletter_headers() {
        let msg = parse_message("42", NEWSLETTER.as_bytes()).unwrap();
        assert_eq!(msg.id, "42");
        assert_eq!(msg.sender, "deals@shop.com");
        assert_eq!(msg.sender_name.as_deref(), Some("Shop & Co"));
        assert_eq!(msg.subject, "Weekend sale");
        assert_eq!(msg.thread_id, "abc123@shop.com");
        assert!(msg.has_unsubscribe);
        assert_eq!(msg.snippet, "Everything is 50% off this weekend.");
        assert_eq!(msg.received_at.to_rfc3339(), "2026-03-07T09:30:00+00:00");
    }

    #[test]
    fn thread_id_prefers_first_reference() {
        let msg = parse_message("7", REPLY.as_bytes()).unwrap();
        assert_eq!(msg.thread_id, "root@example.com");
        assert!(!msg.has_unsubscribe);
        assert_eq!(msg.snippet, "Sure, noon works.");
    }

    #[test]
    fn thread_id_falls_back_to_in_reply_to() {
        let raw = "From: a@x.com\r\n\
Subject: Re: hi\r\n\
Message-ID: <me@x.com>\r\n\
In-Reply-To: <parent@x.com>\r\n\
\r\n\
ok\r\n";
        let msg = parse_message("1", raw.as_bytes()).unwrap();
        assert_eq!(msg.thread_id, "parent@x.com");
    }

    #[test]
    fn thread_id_is_generated_without_any_ids() {
        let raw = "From: a@x.com\r\nSubject: hi\r\n\r\nbody\r\n";
        let msg = parse_message("1", raw.as_bytes()).unwrap();
        assert!(msg.thread_id.starts_with("gen-"));
    }

    #[test]
    fn folded_unsubscribe_header_is_detected() {
        let raw = "From: news@list.com\r\n\
Subject: Digest\r\n\
List-Unsubscribe:\r\n\
\x20<mailto:leave@list.com>,\r\n\
\x20<https://list.com/unsub>\r\n\
\r\n\
body\r\n";
        let msg = parse_message("3", raw.as_bytes()).unwrap();
        assert!(msg.has_unsubscribe);
    }

    #[test]
    fn snippet_is_capped() {
        let long = "word ".repeat(100);
        let s = snippet(&long);
        assert!(s.ends_with("..."));
        assert!(s.chars().count() <= SNIPPET_CHARS + 3);
    }

    #[test]
    fn strip_html_basic() {
        assert_eq!(
            strip_html("<div><b>Bold</b> and <i>italic</i></div>"),
            "Bold and italic"
        );
    }

    #[test]
    fn strip_quotes_and_separator() {
        assert_eq!(
            strip_quoted_text("Line 1\n> quoted\nLine 2\n> more\nLine 3"),
            "Line 1\nLine 2\nLine 3"
        );
        assert_eq!(
            strip_quoted_text("My reply\n\n--- Original Message ---\nOld stuff"),
            "My reply"
        );
    }
}
