use anyhow::Result;
use candle_core::IndexOp;
use qwen_vl_core::{
    VisualInput,
    sampling::{SamplingParams, init_rng, select_token_id},
};
use tracing::debug;

use crate::model::QwenVlModel;

#[derive(Debug, Clone)]
pub struct GenerateOptions {
    pub max_new_tokens: usize,
    pub sampling: SamplingParams,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self {
            max_new_tokens: 512,
            sampling: SamplingParams::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationOutput {
    pub prompt_tokens: usize,
    pub tokens: Vec<i64>,
    pub stopped_on_eos: bool,
}

impl QwenVlModel {
    /// Prefill the prompt (with optional pixels) and decode until an end-of-sequence id or
    /// `max_new_tokens`. `on_token` sees every emitted token; EOS is not emitted.
    pub fn generate<F>(
        &self,
        prompt_ids: &[i64],
        visual: Option<&VisualInput>,
        options: &GenerateOptions,
        mut on_token: F,
    ) -> Result<GenerationOutput>
    where
        F: FnMut(i64) -> Result<()>,
    {
        let mut output = GenerationOutput {
            prompt_tokens: prompt_ids.len(),
            tokens: Vec::new(),
            stopped_on_eos: false,
        };
        if options.max_new_tokens == 0 {
            return Ok(output);
        }

        let mut session = self.new_session();
        let mut rng = init_rng(options.sampling.seed);
        let mut context = prompt_ids.to_vec();
        let mut logits = self.step(prompt_ids, visual, Some(&mut session))?;
        debug!(
            prompt_tokens = prompt_ids.len(),
            rope_delta = session.rope_delta(),
            "prefill complete"
        );
        loop {
            let last = logits.i((0, logits.dim(1)? - 1))?;
            let token = select_token_id(&last, &options.sampling, &context, &mut rng)?;
            if self.config().is_eos(token) {
                output.stopped_on_eos = true;
                break;
            }
            output.tokens.push(token);
            context.push(token);
            on_token(token)?;
            if output.tokens.len() >= options.max_new_tokens {
                break;
            }
            logits = self.step(&[token], None, Some(&mut session))?;
        }
        session.finish();
        Ok(output)
    }
}
