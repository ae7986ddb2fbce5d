use std::path::PathBuf;
use std::process;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use vfit_contracts::assets::ImageAsset;
use vfit_contracts::events::{now_utc_iso, EventLog};
use vfit_contracts::session::{ResultStatus, SessionMode, SessionState};
use vfit_contracts::styles::{FitStyle, ScenePresetRegistry};
use vfit_contracts::summary::{write_summary, RunSummary};
use vfit_engine::{
    run_fitting, DryrunProvider, EnvCredentialPrompt, FittingProvider, GeminiProvider,
    RetryCountdown, DEFAULT_GEMINI_MODEL,
};

#[derive(Debug, Parser)]
#[command(name = "vfit", version, about = "Virtual fitting room CLI")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Fit a single garment onto a subject photo.
    Fit(FitArgs),
    /// Fit a catalog of garments, one sequential generation per garment.
    Batch(BatchArgs),
    /// List the built-in scene presets.
    Presets,
}

#[derive(Debug, Args)]
struct SharedArgs {
    /// Photo of the person (full-body or upper-body shot).
    #[arg(long)]
    subject: PathBuf,
    /// Drape tightness: tight, standard or loose.
    #[arg(long, default_value = "standard")]
    fit_style: String,
    /// Optional scene preset (see `vfit presets`).
    #[arg(long)]
    preset: Option<String>,
    /// Output directory for generated images, summary.json and events.jsonl.
    #[arg(long, default_value = "vfit-out")]
    out: PathBuf,
    /// Gemini model to call.
    #[arg(long, default_value = DEFAULT_GEMINI_MODEL)]
    model: String,
    /// Use the offline dryrun provider instead of the Gemini API.
    #[arg(long)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct FitArgs {
    #[command(flatten)]
    shared: SharedArgs,
    /// Garment image (flat-lay or ghost mannequin preferred). When
    /// repeated, only the first is used.
    #[arg(long, required = true)]
    garment: Vec<PathBuf>,
}

#[derive(Debug, Args)]
struct BatchArgs {
    #[command(flatten)]
    shared: SharedArgs,
    /// Garment images, repeatable; processed strictly in order.
    #[arg(long, required = true)]
    garment: Vec<PathBuf>,
}

fn main() {
    match run() {
        Ok(code) => process::exit(code),
        Err(err) => {
            eprintln!("vfit error: {err:#}");
            process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Fit(args) => {
            // First file wins, matching single-slot upload semantics.
            let garments: Vec<PathBuf> = args.garment.into_iter().take(1).collect();
            run_session(SessionMode::Single, &args.shared, &garments)
        }
        Command::Batch(args) => run_session(SessionMode::Batch, &args.shared, &args.garment),
        Command::Presets => {
            let registry = ScenePresetRegistry::builtin();
            for name in registry.names() {
                if let Some(preset) = registry.get(&name) {
                    println!("{name:<8} {}", preset.scene_instruction);
                }
            }
            Ok(0)
        }
    }
}

fn run_session(mode: SessionMode, shared: &SharedArgs, garment_paths: &[PathBuf]) -> Result<i32> {
    let fit_style = match shared.fit_style.parse::<FitStyle>() {
        Ok(style) => style,
        Err(message) => {
            eprintln!("vfit: {message}");
            return Ok(2);
        }
    };
    let registry = ScenePresetRegistry::builtin();
    let preset = match shared.preset.as_deref() {
        Some(name) => match registry.resolve(name) {
            Ok(preset) => Some(preset.name),
            Err(message) => {
                eprintln!("vfit: {message}");
                return Ok(2);
            }
        },
        None => None,
    };

    let mut session = SessionState::new(mode);
    session.fit_style = fit_style;
    session.preset = preset;

    match ImageAsset::from_file(&shared.subject) {
        Ok(asset) => session.set_subject(asset),
        Err(message) => {
            eprintln!("vfit: {}: {message}", shared.subject.display());
            return Ok(2);
        }
    }
    for path in garment_paths {
        match ImageAsset::from_file(path) {
            Ok(asset) => session.add_garment(asset),
            Err(message) => {
                eprintln!("vfit: {}: {message}", path.display());
                return Ok(2);
            }
        }
    }

    let run_id = shared
        .out
        .file_name()
        .and_then(|value| value.to_str())
        .filter(|value| !value.is_empty())
        .unwrap_or("vfit-run")
        .to_string();
    let events = EventLog::new(shared.out.join("events.jsonl"), run_id.clone());
    let countdown = RetryCountdown::new();
    let started_at = now_utc_iso();

    let provider: Box<dyn FittingProvider> = if shared.dry_run {
        Box::new(DryrunProvider)
    } else {
        Box::new(GeminiProvider::with_model(&shared.model))
    };

    let outcome = run_fitting(
        &mut session,
        provider.as_ref(),
        &shared.out,
        &events,
        &countdown,
        &EnvCredentialPrompt,
    )?;
    if !outcome.started {
        eprintln!(
            "vfit: {}",
            session
                .error_message
                .as_deref()
                .unwrap_or("unable to start run")
        );
        return Ok(2);
    }

    for (index, row) in session.results.iter().enumerate() {
        match row.status {
            ResultStatus::Success => {
                println!("[{index}] ok       {} -> {}", row.garment_name, row.image_path)
            }
            ResultStatus::Error => println!(
                "[{index}] error    {} -> {}",
                row.garment_name,
                row.error_message.as_deref().unwrap_or("unknown error")
            ),
            ResultStatus::Pending => {
                println!("[{index}] pending  {}", row.garment_name)
            }
        }
    }
    if let Some(message) = &session.error_message {
        eprintln!("vfit: {message}");
    }

    let summary = RunSummary {
        run_id,
        mode: mode.as_str().to_string(),
        fit_style,
        preset: session.preset.clone(),
        started_at,
        finished_at: now_utc_iso(),
        aborted_for_reauth: outcome.aborted_for_reauth,
        items: session.results.clone(),
    };
    write_summary(&shared.out.join("summary.json"), &summary)?;

    if outcome.aborted_for_reauth {
        return Ok(3);
    }
    if outcome.failed > 0 {
        return Ok(1);
    }
    Ok(0)
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::{Cli, Command};

    #[test]
    fn batch_collects_repeated_garments_in_order() {
        let cli = Cli::parse_from([
            "vfit", "batch", "--subject", "me.jpg", "--garment", "a.png", "--garment", "b.png",
            "--fit-style", "loose", "--preset", "studio", "--dry-run",
        ]);
        let Command::Batch(args) = cli.command else {
            panic!("expected batch command");
        };
        assert_eq!(args.garment.len(), 2);
        assert_eq!(args.garment[0].to_str(), Some("a.png"));
        assert_eq!(args.shared.fit_style, "loose");
        assert!(args.shared.dry_run);
    }

    #[test]
    fn fit_requires_subject_and_garment() {
        assert!(Cli::try_parse_from(["vfit", "fit", "--subject", "me.jpg"]).is_err());
        assert!(Cli::try_parse_from(["vfit", "fit", "--garment", "a.png"]).is_err());
        assert!(
            Cli::try_parse_from(["vfit", "fit", "--subject", "me.jpg", "--garment", "a.png"])
                .is_ok()
        );
    }
}
