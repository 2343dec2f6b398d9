use std::path::PathBuf;
use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use cn_app::draft::{DraftPatch, ImageAttachment};
use cn_app::generator::Generator;
use cn_app::generator::backend::config::BackendConfig;
use cn_app::generator::poller::PollExit;
use cn_app::store::StoreSnapshot;
use cn_app::view::{self, ResultView};
use cn_app::Preprocessor;

#[derive(Parser)]
#[command(name = "cn-app", version, about = "Guided image generation with ControlNet preprocessors")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Upload an image and a prompt, then follow the job until it finishes.
    Generate {
        #[arg(long)]
        image: PathBuf,
        #[arg(long)]
        prompt: String,
        #[arg(long, default_value_t = Preprocessor::Canny)]
        preprocessor: Preprocessor,
    },
    /// List recent generations known to the service.
    History {
        #[arg(long)]
        limit: Option<u32>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let mut config = BackendConfig::load()?;

    match args.command {
        Command::Generate { image, prompt, preprocessor } => {
            let generator = Generator::new(config)?;
            generate(&generator, image, prompt, preprocessor).await
        }
        Command::History { limit } => {
            if let Some(limit) = limit {
                config.history_limit = limit;
            }
            let generator = Generator::new(config)?;
            history(&generator).await
        }
    }
}

async fn generate(
    generator: &Generator,
    image: PathBuf,
    prompt: String,
    preprocessor: Preprocessor,
) -> anyhow::Result<()> {
    let attachment = ImageAttachment::from_path(&image)
        .await
        .with_context(|| format!("failed to read {}", image.display()))?;

    generator.update_draft(DraftPatch::image(attachment));
    generator.update_draft(DraftPatch::prompt(prompt));
    generator.update_draft(DraftPatch::preprocessor(preprocessor));

    let stop = CancellationToken::new();
    let renderer = tokio::spawn(render(
        generator.store().watch(),
        generator.config().clone(),
        stop.clone(),
    ));

    let handle = match generator.submit_draft().await {
        Ok(handle) => handle,
        Err(e) => {
            stop.cancel();
            renderer.await?;
            return Err(e.into());
        }
    };
    info!(job_id = %handle.id(), "Following job");

    let exit = tokio::select! {
        exit = handle.finished() => exit,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, cancelling poller");
            generator.shutdown();
            handle.finished().await
        }
    };

    stop.cancel();
    renderer.await?;

    match exit {
        PollExit::Terminal(status) => info!(%status, "Done"),
        other => warn!(?other, "Stopped following job"),
    }

    let snapshot = generator.store().snapshot();
    if let ResultView::Completed { url: Some(url), .. } = view::result_view(&snapshot, generator.config()) {
        println!("{url}");
    }

    Ok(())
}

/// Print the result panel every time it changes, until `stop` fires.
async fn render(mut snapshots: watch::Receiver<StoreSnapshot>, config: BackendConfig, stop: CancellationToken) {
    let mut last: Option<ResultView> = None;

    loop {
        let done = tokio::select! {
            changed = snapshots.changed() => changed.is_err(),
            _ = stop.cancelled() => true,
        };

        let view = view::result_view(&snapshots.borrow_and_update(), &config);
        if last.as_ref() != Some(&view) {
            println!("{}", view.message());
            last = Some(view);
        }

        if done {
            break;
        }
    }
}

async fn history(generator: &Generator) -> anyhow::Result<()> {
    generator.refresh_history().await?;

    let history = generator.store().history();
    if history.is_empty() {
        println!("No generations yet");
    }
    for job in history.iter().rev() {
        println!("{}", view::history_line(job));
    }

    Ok(())
}
