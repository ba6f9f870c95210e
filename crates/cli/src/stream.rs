//! Incremental detokenisation for printing tokens as they are generated.

use anyhow::{Result, anyhow};
use tokenizers::Tokenizer;

pub struct TextStream<'a> {
    tokenizer: &'a Tokenizer,
    ids: Vec<u32>,
    emitted: String,
}

impl<'a> TextStream<'a> {
    pub fn new(tokenizer: &'a Tokenizer) -> Self {
        Self {
            tokenizer,
            ids: Vec::new(),
            emitted: String::new(),
        }
    }

    /// Append a token and return the newly printable text. A trailing partial UTF-8
    /// sequence is held back until a later token completes it.
    pub fn push(&mut self, token: i64) -> Result<String> {
        let id = u32::try_from(token).map_err(|_| anyhow!("token id {token} is negative"))?;
        self.ids.push(id);
        let text = self.decode()?;
        let delta = suffix_after(&self.emitted, &text);
        let delta = match delta.find(char::REPLACEMENT_CHARACTER) {
            Some(idx) => delta[..idx].to_owned(),
            None => delta,
        };
        self.emitted.push_str(&delta);
        Ok(delta)
    }

    /// Flush whatever was held back and return the full text.
    pub fn finish(mut self) -> Result<(String, String)> {
        let text = self.decode()?;
        let delta = suffix_after(&self.emitted, &text);
        self.emitted = text;
        Ok((delta, self.emitted))
    }

    fn decode(&self) -> Result<String> {
        self.tokenizer
            .decode(&self.ids, true)
            .map_err(|err| anyhow!("failed to decode tokens: {err}"))
    }
}

fn suffix_after(previous: &str, current: &str) -> String {
    if let Some(rest) = current.strip_prefix(previous) {
        return rest.to_owned();
    }
    let mut prefix_bytes = 0;
    for (a, b) in previous.chars().zip(current.chars()) {
        if a != b {
            break;
        }
        prefix_bytes += a.len_utf8();
    }
    current[prefix_bytes..].to_owned()
}
