// Message rendering: turns an enriched post into the HTML alert body.

use crate::db::models::{EnrichmentResult, MediaReference, Post};

use super::traits::{Attachment, OutgoingMessage};

/// Telegram's ceiling on a message body, in characters.
pub const MAX_MESSAGE_CHARS: usize = 4096;

/// Truncate text to a maximum number of characters, appending "..." if truncated.
///
/// Counts characters, not bytes, so multi-byte text never splits mid-codepoint.
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    let char_count = text.chars().count();
    if char_count <= max_chars {
        text.to_string()
    } else {
        let truncated: String = text.chars().take(max_chars).collect();
        format!("{truncated}...")
    }
}

/// Escape text for Telegram's HTML parse mode.
pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

/// Render the alert for one post.
///
/// `media` holds only the references that were actually retrieved; failed
/// downloads are omitted by the caller. The analysis section appears only
/// for a successful enrichment.
pub fn render_message(
    post: &Post,
    enrichment: Option<&EnrichmentResult>,
    media: &[MediaReference],
) -> OutgoingMessage {
    let analysis = enrichment
        .filter(|e| e.success)
        .and_then(|e| e.analysis.as_deref());

    // Shrink the free-text parts until the escaped body fits
    let mut text_limit = 2500;
    let mut analysis_limit = 1200;
    let text = loop {
        let body = render_body(post, analysis, media, text_limit, analysis_limit);
        if body.chars().count() <= MAX_MESSAGE_CHARS || text_limit < 16 {
            break body;
        }
        text_limit /= 2;
        analysis_limit /= 2;
    };

    let attachments = media
        .iter()
        .filter_map(|m| {
            m.local_path.clone().map(|path| Attachment { kind: m.kind, path })
        })
        .collect();

    OutgoingMessage { text, attachments }
}

fn render_body(
    post: &Post,
    analysis: Option<&str>,
    media: &[MediaReference],
    text_limit: usize,
    analysis_limit: usize,
) -> String {
    let mut body = format!(
        "<b>@{}</b> · {}\n\n{}",
        escape_html(&post.author_handle),
        post.created_at.format("%Y-%m-%d %H:%M UTC"),
        escape_html(&truncate_chars(&post.text, text_limit)),
    );

    if let Some(analysis) = analysis {
        body.push_str("\n\n<b>Analysis</b>\n");
        body.push_str(&escape_html(&truncate_chars(analysis, analysis_limit)));
    }

    if !media.is_empty() {
        body.push_str("\n\n");
        let links: Vec<String> = media
            .iter()
            .enumerate()
            .map(|(i, m)| {
                format!(
                    "<a href=\"{}\">{} {}</a>",
                    escape_html(&m.url),
                    m.kind.as_str(),
                    i + 1
                )
            })
            .collect();
        body.push_str(&links.join(" | "));
    }

    body.push_str(&format!(
        "\n\n❤ {} · 🔁 {} · 💬 {}\n<a href=\"{}\">View post</a>",
        post.like_count,
        post.repost_count,
        post.reply_count,
        escape_html(&post.permalink()),
    ));
    body
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::{MediaKind, PostState};
    use chrono::{TimeZone, Utc};
    use std::path::PathBuf;

    fn post(text: &str) -> Post {
        Post {
            id: "100".into(),
            author_id: "1".into(),
            author_handle: "alice".into(),
            text: text.into(),
            created_at: Utc.with_ymd_and_hms(2024, 12, 10, 7, 0, 0).unwrap(),
            url: None,
            media: vec![],
            like_count: 3,
            repost_count: 1,
            reply_count: 0,
            state: PostState::Enriched,
        }
    }

    fn enrichment(success: bool) -> EnrichmentResult {
        EnrichmentResult {
            post_id: "100".into(),
            attempt: 1,
            success,
            analysis: success.then(|| "Looks like a launch announcement".to_string()),
            model: Some("gpt-4o-mini".into()),
            usage: None,
            duration_ms: 10,
            error: (!success).then(|| "timeout".to_string()),
            created_at: String::new(),
        }
    }

    #[test]
    fn test_truncate_chars_short_text_unchanged() {
        assert_eq!(truncate_chars("hello", 10), "hello");
    }

    #[test]
    fn test_truncate_chars_multibyte() {
        assert_eq!(truncate_chars("héllo wörld", 5), "héllo...");
    }

    #[test]
    fn test_escape_html() {
        assert_eq!(escape_html("a < b && c > d"), "a &lt; b &amp;&amp; c &gt; d");
    }

    #[test]
    fn test_render_includes_analysis_and_permalink() {
        let msg = render_message(&post("We <3 Rust"), Some(&enrichment(true)), &[]);
        assert!(msg.text.contains("<b>@alice</b>"));
        assert!(msg.text.contains("We &lt;3 Rust"));
        assert!(msg.text.contains("Looks like a launch announcement"));
        assert!(msg.text.contains("https://x.com/alice/status/100"));
        assert!(msg.attachments.is_empty());
    }

    #[test]
    fn test_render_omits_failed_analysis() {
        let msg = render_message(&post("hi"), Some(&enrichment(false)), &[]);
        assert!(!msg.text.contains("Analysis"));
        assert!(!msg.text.contains("timeout"));
    }

    #[test]
    fn test_render_attaches_only_resolved_media() {
        let resolved = MediaReference::new(MediaKind::Image, "https://pbs.example/a.jpg")
            .resolved(PathBuf::from("/tmp/100_0.jpg"));
        let msg = render_message(&post("pic"), None, &[resolved]);
        assert_eq!(msg.attachments.len(), 1);
        assert!(msg.text.contains("image 1"));
    }

    #[test]
    fn test_render_fits_message_ceiling() {
        let huge = "<&>".repeat(5000);
        let mut e = enrichment(true);
        e.analysis = Some("x".repeat(5000));
        let msg = render_message(&post(&huge), Some(&e), &[]);
        assert!(msg.text.chars().count() <= MAX_MESSAGE_CHARS);
    }
}
