use std::{fmt::Display, time::Instant};

use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{VarBuilder, VarMap};
use clap::Parser;
use cli_table::{format::Justify, print_stdout, Cell, Style, Table};
use gemma_core::{get_model_config, initialize_logging, SiglipVisionModel};
use tracing::info;

struct UncertainMs {
    mean: f64,
    std_dev: f64,
}

impl Display for UncertainMs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.3}±{:.3}", self.mean, self.std_dev)
    }
}

fn summarize(measurements: &[f64]) -> UncertainMs {
    let n = measurements.len().max(1) as f64;
    let mean = measurements.iter().sum::<f64>() / n;
    let variance = measurements
        .iter()
        .map(|e| (mean - e).powf(2.))
        .sum::<f64>()
        / n;
    UncertainMs {
        mean,
        std_dev: variance.sqrt(),
    }
}

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Args {
    /// Gemma variant whose vision tower is benchmarked.
    #[arg(long, default_value = "4b")]
    variant: String,

    /// Weight dtype: float16, float, float32 or bfloat16.
    #[arg(long, default_value = "float32")]
    dtype: String,

    /// Number of images per forward pass.
    #[arg(long, short, default_value_t = 1)]
    batch_size: usize,

    /// Number of timed forward passes.
    #[arg(long, short, default_value_t = 3)]
    repetitions: usize,

    /// Override the number of encoder blocks, to benchmark a shallower tower.
    #[arg(long)]
    num_hidden_layers: Option<usize>,

    /// Use zero weights instead of randomly initialized ones.
    #[arg(long, default_value_t = false)]
    zeros: bool,

    /// Integer seed to ensure reproducible random number generation.
    #[arg(short, long)]
    seed: Option<u64>,

    /// Run on the CPU even if an accelerator is available.
    #[arg(long, default_value_t = false)]
    cpu: bool,

    /// Print the resolved configuration as JSON and exit.
    #[arg(long, default_value_t = false)]
    print_config: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    initialize_logging();

    let config = get_model_config(&args.variant, &args.dtype)?;
    if args.print_config {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    let Some(mut vision_config) = config.vision_config.clone() else {
        anyhow::bail!(
            "Variant `{}` has no vision tower; use one of `4b`, `12b` or `27b_v3`.",
            args.variant
        );
    };
    if let Some(num_hidden_layers) = args.num_hidden_layers {
        vision_config.num_hidden_layers = num_hidden_layers;
    }
    if args.repetitions == 0 {
        anyhow::bail!("`repetitions` must be a strictly positive integer, got 0.");
    }

    let device = if args.cpu {
        Device::Cpu
    } else {
        #[cfg(feature = "metal")]
        let device = Device::new_metal(0)?;
        #[cfg(not(feature = "metal"))]
        let device = Device::cuda_if_available(0)?;
        device
    };
    if let Some(seed) = args.seed {
        device.set_seed(seed)?;
    }
    let dtype: DType = config.dtype.for_device(&device);

    info!(
        "avx: {}, neon: {}, simd128: {}, f16c: {}",
        candle_core::utils::with_avx(),
        candle_core::utils::with_neon(),
        candle_core::utils::with_simd128(),
        candle_core::utils::with_f16c()
    );
    info!(
        "Building vision tower for `{}`: {} layers, {}x{} images, dtype {:?}.",
        args.variant,
        vision_config.num_hidden_layers,
        vision_config.image_size,
        vision_config.image_size,
        dtype
    );

    let varmap = VarMap::new();
    let vb = if args.zeros {
        VarBuilder::zeros(dtype, &device)
    } else {
        VarBuilder::from_varmap(&varmap, dtype, &device)
    };
    let model = SiglipVisionModel::new(&vision_config, vb)?;

    let pixels = Tensor::randn(
        0f32,
        1.,
        (
            args.batch_size,
            vision_config.input_channels,
            vision_config.image_size,
            vision_config.image_size,
        ),
        &device,
    )?
    .to_dtype(dtype)?;

    // Warmup
    let mut output_dims = model.forward(&pixels)?.dims().to_vec();
    device.synchronize()?;

    let mut timings = Vec::with_capacity(args.repetitions);
    for _ in 0..args.repetitions {
        let start = Instant::now();
        let out = model.forward(&pixels)?;
        device.synchronize()?;
        timings.push(start.elapsed().as_secs_f64() * 1000.);
        output_dims = out.dims().to_vec();
    }

    let backend = match device {
        Device::Cpu => "CPU",
        Device::Cuda(_) => "CUDA",
        Device::Metal(_) => "Metal",
    };
    let ms = summarize(&timings);
    info!("{} timed forward passes: {ms} ms.", args.repetitions);
    let images_per_sec = args.batch_size as f64 * 1000. / ms.mean;
    let table = vec![vec![
        args.variant.as_str().cell(),
        backend.cell(),
        args.batch_size.cell().justify(Justify::Right),
        format!("{output_dims:?}").cell(),
        format!("{:.3}", ms.mean).cell().justify(Justify::Right),
        format!("{:.3}", ms.std_dev).cell().justify(Justify::Right),
        format!("{images_per_sec:.2}").cell().justify(Justify::Right),
    ]]
    .table()
    .title(vec![
        "variant".cell().bold(true),
        "backend".cell().bold(true),
        "batch".cell().bold(true),
        "output".cell().bold(true),
        "mean ms".cell().bold(true),
        "std-dev ms".cell().bold(true),
        "images/s".cell().bold(true),
    ])
    .bold(true);
    print_stdout(table)?;

    Ok(())
}
