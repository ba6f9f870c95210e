use std::{
    io::{self, Write},
    path::{Path, PathBuf},
    time::Instant,
};

use anyhow::{Context, Result};
use image::DynamicImage;
use qwen_vl_config::{AppConfig, ConfigOverride, LocalFileSystem, ModelResources};
use qwen_vl_core::{runtime::prepare_device_and_dtype, weights::summarize_weights};
use qwen_vl_infer_qwen2_vl::{
    GenerateOptions, PromptMedia, QwenVlModel, build_prompt_tokens, load_config,
};
use tracing::info;

use crate::{
    args::{GenerateArgs, InspectArgs},
    prompt::load_prompt,
    resources::{load_tokenizer, resolve_model_dir},
    stream::TextStream,
};

const APP_NAME: &str = "qwen-vl";

struct Loaded {
    fs: LocalFileSystem,
    app_config: AppConfig,
    resources: ModelResources,
}

fn load_app_config(config_path: Option<&Path>, overrides: impl ConfigOverride) -> Result<Loaded> {
    let fs = LocalFileSystem::new(APP_NAME);
    let (mut app_config, descriptor) = AppConfig::load_or_init(&fs, config_path)?;
    app_config += overrides;
    app_config.normalise();
    let resources = app_config.active_model_resources()?;
    info!(
        "Using configuration {} (active model `{}`)",
        descriptor.location.display_with(&fs)?,
        app_config.models.active
    );
    Ok(Loaded {
        fs,
        app_config,
        resources,
    })
}

pub fn run_generate(args: GenerateArgs, quiet: bool) -> Result<()> {
    let prompt = load_prompt(&args)?;
    let Loaded {
        fs,
        app_config,
        resources,
    } = load_app_config(args.model.config.as_deref(), &args)?;
    let inference = &app_config.inference;

    let model_dir = resolve_model_dir(&fs, &resources)?;
    let (device, dtype) = prepare_device_and_dtype(inference.device, inference.precision)?;
    info!(
        "Loading model `{}` (device={:?}, dtype={:?}) from {}",
        resources.id,
        device,
        dtype,
        model_dir.display()
    );
    let load_start = Instant::now();
    let mut model = QwenVlModel::load_from_dir(&model_dir, &device, dtype)?;
    info!(
        "Model ready in {:.2?} (family={})",
        load_start.elapsed(),
        model.config().family.model_type()
    );
    if inference.min_pixels.is_some() || inference.max_pixels.is_some() {
        let current = model.image_processor().clone();
        let min_pixels = inference.min_pixels.unwrap_or(current.min_pixels);
        let max_pixels = inference.max_pixels.unwrap_or(current.max_pixels);
        model.set_image_processor(current.with_pixel_bounds(min_pixels, max_pixels));
    }

    let tokenizer = load_tokenizer(&model_dir)?;

    let visual = if !args.frames.is_empty() {
        let frames = open_images(&args.frames)?;
        Some(model.prepare_video(&frames, args.fps)?)
    } else if !args.images.is_empty() {
        let images = open_images(&args.images)?;
        Some(model.prepare_images(&images)?)
    } else {
        None
    };
    let media = visual.as_ref().map(|visual| {
        if args.frames.is_empty() {
            PromptMedia::images(&visual.grids)
        } else {
            PromptMedia::videos(&visual.grids)
        }
    });
    let prompt_ids = build_prompt_tokens(
        &tokenizer,
        model.config(),
        inference.system_prompt.as_deref(),
        &prompt,
        media,
    )?;
    info!(
        "Prompt prepared: {} tokens ({} visual grids)",
        prompt_ids.len(),
        visual.as_ref().map_or(0, |visual| visual.grids.len())
    );

    let options = GenerateOptions {
        max_new_tokens: inference.max_new_tokens,
        sampling: inference.sampling(),
    };
    info!(
        "Starting generation with requested budget {} tokens",
        options.max_new_tokens
    );
    let mut stream = TextStream::new(&tokenizer);
    let mut stdout = io::stdout();
    let gen_start = Instant::now();
    let output = model
        .generate(&prompt_ids, visual.as_ref(), &options, |token| {
            let delta = stream.push(token)?;
            if !quiet && !delta.is_empty() {
                write!(stdout, "{delta}")?;
                stdout.flush()?;
            }
            Ok(())
        })
        .context("generation failed")?;
    let elapsed = gen_start.elapsed();

    let (rest, text) = stream.finish()?;
    if quiet {
        println!("{text}");
    } else {
        if !rest.is_empty() {
            write!(stdout, "{rest}")?;
        }
        writeln!(stdout)?;
        stdout.flush()?;
    }

    let generated = output.tokens.len();
    let secs = elapsed.as_secs_f64();
    let rate = if secs > 0.0 {
        generated as f64 / secs
    } else {
        0.0
    };
    info!(
        "Generated {generated} tokens in {elapsed:.2?} ({rate:.2} tok/s, eos={})",
        output.stopped_on_eos
    );
    Ok(())
}

pub fn run_inspect(args: InspectArgs) -> Result<()> {
    let Loaded { fs, resources, .. } = load_app_config(args.model.config.as_deref(), &args)?;
    let model_dir = resolve_model_dir(&fs, &resources)?;
    let loaded = load_config(&model_dir)?;
    let cfg = &loaded.value;

    println!("config: {}", loaded.path.display());
    println!("family: {}", cfg.family.model_type());
    println!(
        "text: hidden={} layers={} heads={} kv_heads={} vocab={} mrope={:?}",
        cfg.text.hidden_size,
        cfg.text.num_hidden_layers,
        cfg.text.num_attention_heads,
        cfg.text.num_key_value_heads,
        cfg.vocab_size,
        cfg.text.mrope_section
    );
    println!(
        "vision: depth={} hidden={} heads={} patch={} merge={} temporal={} out={}",
        cfg.vision.depth,
        cfg.vision.hidden_size,
        cfg.vision.num_heads,
        cfg.vision.patch_size,
        cfg.vision.spatial_merge_size,
        cfg.vision.temporal_patch_size,
        cfg.vision.out_hidden_size
    );
    if let Some(window) = cfg.vision.window_size {
        println!(
            "vision windows: size={window} full-attention blocks={:?}",
            cfg.vision.fullatt_block_indexes
        );
    }
    println!(
        "tokens: image={} video={} vision_start={} vision_end={} eos={:?}",
        cfg.image_token_id,
        cfg.video_token_id,
        cfg.vision_start_token_id,
        cfg.vision_end_token_id,
        cfg.eos_token_id
    );

    let summary = summarize_weights(&model_dir, args.sample)?;
    println!(
        "weights: {} archives, {} tensors, {} bytes",
        summary.archives.len(),
        summary.tensor_count,
        summary.total_bytes
    );
    for archive in &summary.archives {
        println!(
            "  {} ({} tensors, {} bytes)",
            archive.path.display(),
            archive.tensor_count,
            archive.file_size
        );
    }
    for record in &summary.sample {
        println!(
            "  {} {:?} {:?} ({} bytes)",
            record.name, record.dtype, record.shape, record.num_bytes
        );
    }
    Ok(())
}

fn open_images(paths: &[PathBuf]) -> Result<Vec<DynamicImage>> {
    paths
        .iter()
        .map(|path| {
            image::open(path).with_context(|| format!("failed to open image at {}", path.display()))
        })
        .collect()
}
