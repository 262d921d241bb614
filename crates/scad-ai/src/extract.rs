//! Pulls an OpenSCAD program out of free-form model output.
//!
//! The rules, in order:
//!
//! 1. Whitespace-only output carries no script.
//! 2. If the output contains fenced blocks (```` ``` ````), they are tried in
//!    tag order: `scad` or `openscad`, then `c`, then untagged, then any other
//!    tag, earlier blocks first within a tag. The first block that looks like
//!    OpenSCAD wins. A fence that is never closed runs to the end of the
//!    output, and a fence closed on its opening line is an untagged block.
//! 3. Without fences the whole output is taken as the script.
//! 4. A script must contain at least one of `;`, `{` or `}` to count as
//!    OpenSCAD source.

const FENCE: &str = "```";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtractError {
    Empty,
    NoScriptContent,
}

impl ExtractError {
    pub fn detail(&self) -> &'static str {
        match self {
            ExtractError::Empty => "model returned an empty response",
            ExtractError::NoScriptContent => {
                "model response does not contain recognizable OpenSCAD source"
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct FencedBlock<'a> {
    tag: &'a str,
    body: &'a str,
}

pub fn extract_script(response: &str) -> Result<String, ExtractError> {
    let trimmed = response.trim();
    if trimmed.is_empty() {
        return Err(ExtractError::Empty);
    }

    let mut blocks = fenced_blocks(trimmed);
    if blocks.is_empty() {
        return if looks_like_scad(trimmed) {
            Ok(trimmed.to_string())
        } else {
            Err(ExtractError::NoScriptContent)
        };
    }

    // Stable, so blocks of equal rank keep their order in the response.
    blocks.sort_by_key(|block| tag_rank(block.tag));
    if let Some(block) = blocks
        .iter()
        .map(|block| block.body.trim())
        .find(|body| looks_like_scad(body))
    {
        return Ok(block.to_string());
    }

    if blocks.iter().all(|block| block.body.trim().is_empty()) {
        Err(ExtractError::Empty)
    } else {
        Err(ExtractError::NoScriptContent)
    }
}

fn tag_rank(tag: &str) -> u8 {
    match tag.to_ascii_lowercase().as_str() {
        "scad" | "openscad" => 0,
        "c" => 1,
        "" => 2,
        _ => 3,
    }
}

fn fenced_blocks(text: &str) -> Vec<FencedBlock<'_>> {
    let mut blocks = Vec::new();
    let mut rest = text;

    while let Some(open) = rest.find(FENCE) {
        let after_fence = &rest[open + FENCE.len()..];
        let line_end = after_fence.find('\n').unwrap_or(after_fence.len());

        if let Some(close) = after_fence[..line_end].find(FENCE) {
            blocks.push(FencedBlock {
                tag: "",
                body: &after_fence[..close],
            });
            rest = &after_fence[close + FENCE.len()..];
            continue;
        }

        let info = &after_fence[..line_end];
        let body_start = after_fence.get(line_end + 1..).unwrap_or_default();
        let tag = info.split_whitespace().next().unwrap_or_default();

        match body_start.find(FENCE) {
            Some(close) => {
                blocks.push(FencedBlock {
                    tag,
                    body: &body_start[..close],
                });
                rest = &body_start[close + FENCE.len()..];
            }
            None => {
                blocks.push(FencedBlock {
                    tag,
                    body: body_start,
                });
                break;
            }
        }
    }

    blocks
}

fn looks_like_scad(candidate: &str) -> bool {
    candidate.contains(';') || candidate.contains('{') || candidate.contains('}')
}
