//! Pull raw file content out of model output that may be wrapped in
//! markdown fences or prose.

#[derive(Debug, Clone, PartialEq, Eq)]
struct Block {
    lang: String,
    code: String,
}

/// Fence tags that mark a block as the file's language.
fn fence_tags(filename: &str) -> &'static [&'static str] {
    let ext = filename.rsplit_once('.').map(|(_, ext)| ext).unwrap_or_default();
    match ext {
        "py" => &["python", "py", "python3"],
        "html" | "htm" => &["html", "htm"],
        "js" => &["javascript", "js", "jsx"],
        "ts" => &["typescript", "ts"],
        "css" => &["css"],
        "json" => &["json"],
        "sh" => &["sh", "bash", "shell", "zsh"],
        "md" => &["markdown", "md"],
        _ => &[],
    }
}

fn fenced_blocks(text: &str) -> Vec<Block> {
    let mut blocks = Vec::new();
    let mut current: Option<Block> = None;

    for line in text.lines() {
        let trimmed = line.trim();
        if let Some(info) = trimmed.strip_prefix("```") {
            match current.take() {
                Some(block) => {
                    if !block.code.is_empty() {
                        blocks.push(block);
                    }
                }
                None => {
                    current = Some(Block {
                        lang: info.trim().to_lowercase(),
                        code: String::new(),
                    });
                }
            }
            continue;
        }
        if let Some(block) = current.as_mut() {
            if !block.code.is_empty() {
                block.code.push('\n');
            }
            block.code.push_str(line);
        }
    }
    // Unterminated fence: keep what we have.
    if let Some(block) = current
        && !block.code.is_empty()
    {
        blocks.push(block);
    }
    blocks
}

/// Extract the file body for `filename` from `content`.
///
/// With no fences the content is returned unchanged. Otherwise the first block
/// tagged with the file's language wins, falling back to the longest block.
pub fn extract_file_content(filename: &str, content: &str) -> String {
    if !content.contains("```") {
        return content.to_string();
    }
    let blocks = fenced_blocks(content);
    let tags = fence_tags(filename);

    let chosen = blocks
        .iter()
        .find(|b| {
            let tag = b.lang.split_whitespace().next().unwrap_or_default();
            tags.contains(&tag)
        })
        .or_else(|| blocks.iter().max_by_key(|b| b.code.len()));

    match chosen {
        Some(block) => {
            tracing::trace!(file = filename, lang = %block.lang, blocks = blocks.len(), "Extracted fenced block");
            block.code.clone()
        }
        None => content.to_string(),
    }
}
