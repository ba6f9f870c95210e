use std::fs;

use anyhow::{Context, Result, anyhow};

use crate::args::GenerateArgs;

pub fn load_prompt(args: &GenerateArgs) -> Result<String> {
    if let Some(path) = &args.prompt_file {
        return fs::read_to_string(path)
            .with_context(|| format!("failed to read prompt file {}", path.display()))
            .map(|s| s.trim_end().to_owned());
    }
    if let Some(prompt) = &args.prompt {
        return Ok(prompt.clone());
    }
    Err(anyhow!("prompt is required (use --prompt or --prompt-file)"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_file_is_trimmed() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("prompt.txt");
        fs::write(&path, "Describe <image>\n\n")?;
        let args = GenerateArgs {
            prompt_file: Some(path),
            ..GenerateArgs::default()
        };
        assert_eq!(load_prompt(&args)?, "Describe <image>");
        Ok(())
    }

    #[test]
    fn missing_prompt_is_an_error() {
        let err = load_prompt(&GenerateArgs::default()).expect_err("no prompt given");
        assert!(err.to_string().contains("--prompt"));
    }
}
