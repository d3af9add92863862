use std::path::PathBuf;
use std::time::Instant;

use clap::Parser;
use env_logger::Env;

use pendant_drop_rust_lib::image_io::get_image_files_in_dir;
use pendant_drop_rust_lib::{
    load_image_sequence, save_session, AnalysisSession, AnalysisStatus, Config, PendantDropError, Result,
};

/// Command-line arguments
#[derive(Parser, Debug)]
#[clap(author, version, about = "Pendant drop tensiometry - interfacial tension from drop images")]
struct Args {
    /// Path to an input image or a directory of images
    #[clap(short, long)]
    input: Option<String>,

    /// Path to output directory
    #[clap(short, long)]
    output: Option<String>,

    /// Path to configuration file
    #[clap(short, long, default_value = "config.toml")]
    config: String,

    /// Seconds between consecutive images (overwrites config)
    #[clap(short = 'f', long)]
    frame_interval: Option<f64>,

    /// Enable debug logging
    #[clap(short, long)]
    debug: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let default_level = if args.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(Env::default().default_filter_or(default_level)).init();

    // Load configuration
    let mut config = Config::from_file(&args.config)?;

    // Override config with command-line arguments
    if let Some(input) = args.input.clone() {
        config.input_path = input;
    }

    if let Some(output) = args.output.clone() {
        config.output_base_dir = output;
    }

    if let Some(interval) = args.frame_interval {
        config.frame_interval = interval;
    }

    config.validate()?;

    let start_time = Instant::now();

    // Collect input images
    let input_path = PathBuf::from(&config.input_path);
    let paths = if input_path.is_file() {
        vec![input_path]
    } else if input_path.is_dir() {
        get_image_files_in_dir(&input_path)?
    } else {
        return Err(PendantDropError::InvalidPath(input_path));
    };
    log::info!("Found {} images in {}", paths.len(), config.input_path);

    let images = load_image_sequence(&paths, config.frame_interval)?;

    // Analyse every drop
    let mut session = AnalysisSession::new(&config)?;
    session.start(images)?;
    session.wait();

    let mut done = 0;
    for (_, analysis) in session.analyses() {
        match analysis.status() {
            AnalysisStatus::Done => done += 1,
            status => log::warn!(
                "{}: {:?}{}",
                analysis.input().filename,
                status,
                analysis.error().map(|e| format!(" ({})", e)).unwrap_or_default()
            ),
        }
    }
    log::info!("{} of {} drops analysed", done, session.len());

    // Save results
    save_session(&session, &config.output_base_dir)?;
    session.mark_saved();

    let elapsed = start_time.elapsed();
    println!("Processing completed in {:.2} seconds", elapsed.as_secs_f64());

    Ok(())
}
