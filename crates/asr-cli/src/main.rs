//!
//! CLI для распознавания речи моделью Listen, Attend and Spell.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::time::Instant;

use asr_core::{FeatureBatch, TargetBatch};
use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use model_las::{vocab, LasConfig, LasModel};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::info;

#[derive(Parser)]
#[command(name = "rustasr")]
#[command(author, version, about = "RustASR: Listen, Attend and Spell", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Проверить установку: собрать модель со случайными весами и прогнать сценарии
    Check {
        /// Device to use (cpu, metal, cuda)
        #[arg(long, default_value = "cpu")]
        device: String,

        /// Маленькая конфигурация вместо librispeech
        #[arg(long, default_value_t = false)]
        tiny: bool,

        /// Seed для scheduled sampling
        #[arg(long, default_value_t = 0)]
        seed: u64,
    },

    /// Распознать готовые лог-mel признаки (.npy)
    Decode {
        /// Path to the model directory (config.json + model.safetensors)
        #[arg(long)]
        model: PathBuf,

        /// Признаки `[frames, mels]` или `[1, frames, mels]`
        #[arg(long)]
        features: PathBuf,

        /// Маска фреймов `[frames]` или `[1, frames]` (по умолчанию все валидны)
        #[arg(long)]
        mask: Option<PathBuf>,

        /// Device to use (cpu, metal, cuda)
        #[arg(long, default_value = "cpu")]
        device: String,

        /// Лимит шагов декодера (по умолчанию из config.json)
        #[arg(long)]
        max_steps: Option<usize>,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Check { device, tiny, seed } => {
            println!("🧪 RustASR - LAS Setup Check");
            println!("============================");

            let device = create_device(&device)?;
            let config = if tiny {
                LasConfig::tiny()
            } else {
                LasConfig::librispeech()
            };
            run_check(config, &device, seed)
        }

        Commands::Decode {
            model,
            features,
            mask,
            device,
            max_steps,
        } => {
            println!("🎤 RustASR - LAS Decode");
            println!("=======================");
            println!("Model: {}", model.display());
            println!("Features: {}", features.display());
            println!("Device: {}", device);
            println!();

            let device = create_device(&device)?;
            let start = Instant::now();
            let las = LasModel::load(&model, &device)?;
            println!("Model loaded in {:.2}s", start.elapsed().as_secs_f64());

            let batch = read_features(&features, mask.as_deref(), &device)?;
            let frames = batch.num_frames();
            let batch = batch.trim_to_multiple(las.config().downsample_factor())?;
            info!(
                frames,
                kept = batch.num_frames(),
                mels = batch.num_mels(),
                "Features prepared"
            );

            let start = Instant::now();
            let max_steps = max_steps.unwrap_or(las.config().max_decode_steps);
            let out = las.decode_with_limit(&batch, max_steps)?;

            println!("📝 {}", out.text());
            println!(
                "({} символов, {:?}, {:.2}s)",
                out.tokens.len(),
                out.stop_reason,
                start.elapsed().as_secs_f64()
            );
            Ok(())
        }
    }
}

/// Сценарии проверки на модели со случайными весами.
fn run_check(config: LasConfig, device: &Device, seed: u64) -> Result<()> {
    println!("Config: {}", config.model_name);

    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
    let model = LasModel::new(config, vb)?;
    let n_params: usize = varmap.all_vars().iter().map(|v| v.elem_count()).sum();
    info!(n_params, device = ?device, "Random LAS model built");
    println!("Parameters: {n_params}");

    // 160 фреймов тишины → 160 / 2^depth векторов listener'а
    let features = Tensor::zeros((1, 160, model.config().n_mels), DType::F32, device)?;
    let features = FeatureBatch::unmasked(features)?;
    let memory = model.listen(&features)?;
    println!("✅ Listener: {:?} → {:?}", features.features.dims(), memory.features.dims());

    let ids = vocab::encode("cat", model.config().max_target_chars)?;
    let one_hot = vocab::one_hot(&ids, model.config().vocab_size, device)?.unsqueeze(0)?;
    let ground_truth = TargetBatch::from_padded(one_hot)?;
    let (inputs, _) = ground_truth.teacher_forcing_split()?;
    let logits = model.forward(&features, &inputs)?;
    println!("✅ Teacher forcing '^cat$': logits {:?}", logits.dims());

    let mut rng = StdRng::seed_from_u64(seed);
    let scores = model.score_blended(&features, &ground_truth, &mut rng)?;
    println!(
        "✅ Score (blend p={}): loss={:.4}, accuracy={:.4}",
        model.config().prev_prediction_fraction,
        scores.loss_value()?,
        scores.accuracy_value()?
    );

    let out = model.decode_with_limit(&features, 5)?;
    println!(
        "✅ Greedy decode (cap 5): {} символов, {:?}",
        out.tokens.len(),
        out.stop_reason
    );
    Ok(())
}

/// Прочитать признаки и маску из .npy в батч из одного высказывания.
fn read_features(path: &Path, mask: Option<&Path>, device: &Device) -> Result<FeatureBatch> {
    let features = Tensor::read_npy(path)
        .with_context(|| format!("не удалось прочитать {}", path.display()))?
        .to_dtype(DType::F32)?;
    let features = match features.rank() {
        2 => features.unsqueeze(0)?,
        3 => features,
        r => bail!("признаки должны быть [frames, mels] или [1, frames, mels], rank={r}"),
    }
    .to_device(device)?;

    let Some(mask_path) = mask else {
        return Ok(FeatureBatch::unmasked(features)?);
    };
    let mask = Tensor::read_npy(mask_path)
        .with_context(|| format!("не удалось прочитать {}", mask_path.display()))?;
    let mask = match mask.rank() {
        1 => mask.unsqueeze(0)?,
        2 => mask,
        r => bail!("маска должна быть [frames] или [1, frames], rank={r}"),
    }
    .to_device(device)?;
    Ok(FeatureBatch::new(features, mask)?)
}

fn create_device(device: &str) -> Result<Device> {
    match device {
        "metal" => {
            // candle может panic в процессе инициализации Metal (например, если устройство недоступно).
            // Панику ловим, а hook временно глушим, чтобы не засорять stderr.
            let prev_hook = std::panic::take_hook();
            std::panic::set_hook(Box::new(|_| {}));
            let res = std::panic::catch_unwind(|| Device::new_metal(0));
            std::panic::set_hook(prev_hook);

            match res {
                Ok(Ok(dev)) => Ok(dev),
                Ok(Err(e)) => Err(e.into()),
                Err(_) => Err(anyhow::anyhow!(
                    "Инициализация Metal недоступна в этом окружении. Попробуйте --device cpu."
                )),
            }
        }
        "cuda" => Ok(Device::new_cuda(0)?),
        _ => Ok(Device::Cpu),
    }
}
