//! Qwen chat-template prompt construction with expanded visual placeholders.

use anyhow::{Result, anyhow, ensure};
use qwen_vl_core::{GridSpec, MediaKind};
use tokenizers::Tokenizer;

use crate::config::ModelConfig;

pub const IMAGE_MARKER: &str = "<image>";
pub const VIDEO_MARKER: &str = "<video>";
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant.";
const IM_START: &str = "<|im_start|>";
const IM_END: &str = "<|im_end|>";

/// Media attached to a prompt: its kind and the patch grid of every item, in order.
#[derive(Debug, Clone, Copy)]
pub struct PromptMedia<'a> {
    pub kind: MediaKind,
    pub grids: &'a [GridSpec],
}

impl<'a> PromptMedia<'a> {
    pub fn images(grids: &'a [GridSpec]) -> Self {
        Self {
            kind: MediaKind::Image,
            grids,
        }
    }

    pub fn videos(grids: &'a [GridSpec]) -> Self {
        Self {
            kind: MediaKind::Video,
            grids,
        }
    }

    fn marker(&self) -> &'static str {
        match self.kind {
            MediaKind::Image => IMAGE_MARKER,
            MediaKind::Video => VIDEO_MARKER,
        }
    }
}

fn encode_text(tokenizer: &Tokenizer, text: &str, out: &mut Vec<i64>) -> Result<()> {
    if text.is_empty() {
        return Ok(());
    }
    let encoding = tokenizer
        .encode(text, false)
        .map_err(|err| anyhow!("tokenization failed: {err}"))?;
    out.extend(encoding.get_ids().iter().map(|&id| id as i64));
    Ok(())
}

fn special_token(tokenizer: &Tokenizer, token: &str) -> Result<i64> {
    tokenizer
        .token_to_id(token)
        .map(i64::from)
        .ok_or_else(|| anyhow!("tokenizer has no {token} token"))
}

/// Tokenize a single-turn chat prompt. Every `<image>`/`<video>` marker in `user` becomes
/// `<|vision_start|>`, one placeholder per merged grid cell, `<|vision_end|>`. Without
/// markers the media is placed ahead of the text.
pub fn build_prompt_tokens(
    tokenizer: &Tokenizer,
    cfg: &ModelConfig,
    system: Option<&str>,
    user: &str,
    media: Option<PromptMedia<'_>>,
) -> Result<Vec<i64>> {
    let im_start = special_token(tokenizer, IM_START)?;
    let im_end = special_token(tokenizer, IM_END)?;
    let merge = cfg.vision.spatial_merge_size;

    let mut tokens = Vec::new();
    tokens.push(im_start);
    encode_text(
        tokenizer,
        &format!("system\n{}", system.unwrap_or(DEFAULT_SYSTEM_PROMPT)),
        &mut tokens,
    )?;
    tokens.push(im_end);
    encode_text(tokenizer, "\n", &mut tokens)?;
    tokens.push(im_start);
    encode_text(tokenizer, "user\n", &mut tokens)?;

    match media {
        None => encode_text(tokenizer, user, &mut tokens)?,
        Some(media) => {
            let placeholder = cfg.placeholders().id_for(media.kind);
            let push_visual = |grid: &GridSpec, tokens: &mut Vec<i64>| -> Result<()> {
                tokens.push(cfg.vision_start_token_id);
                let count = grid.token_count(merge)?;
                tokens.extend(std::iter::repeat_n(placeholder, count));
                tokens.push(cfg.vision_end_token_id);
                Ok(())
            };
            let segments: Vec<&str> = user.split(media.marker()).collect();
            if segments.len() == 1 {
                for grid in media.grids {
                    push_visual(grid, &mut tokens)?;
                }
                encode_text(tokenizer, user, &mut tokens)?;
            } else {
                ensure!(
                    segments.len() - 1 == media.grids.len(),
                    "prompt has {} {} markers but {} inputs were supplied",
                    segments.len() - 1,
                    media.marker(),
                    media.grids.len()
                );
                for (idx, segment) in segments.iter().enumerate() {
                    encode_text(tokenizer, segment, &mut tokens)?;
                    if let Some(grid) = media.grids.get(idx) {
                        push_visual(grid, &mut tokens)?;
                    }
                }
            }
        }
    }

    tokens.push(im_end);
    encode_text(tokenizer, "\n", &mut tokens)?;
    tokens.push(im_start);
    encode_text(tokenizer, "assistant\n", &mut tokens)?;
    Ok(tokens)
}
