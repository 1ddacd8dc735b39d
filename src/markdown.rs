/// Markdown-safe translation support.
///
/// Markdown bodies go to the provider in one call, but image blocks
/// `![caption](url)` must not: the URL has to survive byte-for-byte and
/// the caption wants its own translation. This module swaps each image
/// block for a placeholder token before the body translation and rebuilds
/// the blocks afterwards.
use regex::Regex;
use std::sync::OnceLock;

/// One image block lifted out of a markdown body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageBlock {
    /// The caption between the brackets (may be empty)
    pub caption: String,
    /// The URL between the parentheses, preserved exactly
    pub url: String,
    /// The placeholder token standing in for the block
    pub token: String,
}

fn image_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"!\[([^\]]*)\]\(([^)]+)\)").expect("image pattern"))
}

/// Replace every image block with a unique placeholder token.
///
/// Returns the placeholdered body and the extracted blocks in document
/// order. Tokens are plain ASCII so every provider passes them through
/// with formatting preservation enabled.
pub fn extract_images(markdown: &str) -> (String, Vec<ImageBlock>) {
    let mut blocks = Vec::new();
    let body = image_regex()
        .replace_all(markdown, |caps: &regex::Captures<'_>| {
            let token = format!("__IMG_PLACEHOLDER_{}__", blocks.len());
            blocks.push(ImageBlock {
                caption: caps[1].to_string(),
                url: caps[2].to_string(),
                token: token.clone(),
            });
            token
        })
        .into_owned();
    (body, blocks)
}

/// Rebuild image blocks in a translated body.
///
/// `translated_captions[i]` is the translation of `blocks[i].caption`, or
/// `None` when that translation failed; the original block is restored
/// verbatim in that case. URLs are always the original ones.
pub fn restore_images(
    translated_body: &str,
    blocks: &[ImageBlock],
    translated_captions: &[Option<String>],
) -> String {
    let mut body = translated_body.to_string();
    for (i, block) in blocks.iter().enumerate() {
        let caption = translated_captions
            .get(i)
            .and_then(Option::as_ref)
            .unwrap_or(&block.caption);
        let rebuilt = format!("![{}]({})", caption, block.url);
        body = body.replace(&block.token, &rebuilt);
    }
    body
}
