use chatdrop::{ObjectStorageFactory, Pipeline, PipelineOutcome, TriggerEvent};
use clap::{Parser, Subcommand};
use color_eyre::eyre::{eyre, WrapErr};
use std::io::Read;
use std::path::PathBuf;
use url::Url;

mod progress;

/// Unpack zip archives uploaded to object storage, republish their contents, and mirror chat
/// exports
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Operation to perform
    #[clap(subcommand)]
    command: Command,

    #[clap(flatten)]
    globals: Globals,
}

/// Arguments that apply regardless of command
#[derive(Parser, Debug)]
struct Globals {
    /// Enable verbose log output
    #[clap(short = 'v', long, conflicts_with = "quiet", global = true)]
    verbose: bool,

    /// Be quiet, suppress almost all output (except errors)
    #[clap(short = 'q', long, conflicts_with = "verbose", global = true)]
    quiet: bool,

    #[clap(flatten)]
    config: chatdrop::Config,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the pipeline for a single object, as if it had just been uploaded
    Process {
        /// URL of the object, ie `s3://bucket/user/u1/uploads/backup.zip`
        #[clap(value_parser, value_name = "URL")]
        object: Url,

        /// Content type of the object.  Only logged; it plays no part in deciding what to do.
        #[clap(long)]
        content_type: Option<String>,
    },

    /// Run the pipeline for each object created in an S3 event notification
    Event {
        /// Read the notification JSON from a file instead of stdin
        #[clap(short = 'f', long, value_parser)]
        file: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;

    let args = Args::parse();

    init_logging(&args.globals)?;

    let (pipeline, events) = match &args.command {
        Command::Process {
            object,
            content_type,
        } => {
            let factory = ObjectStorageFactory::instance(args.globals.config.clone());
            let storage = factory.from_url(object).await?;
            let (bucket, key) = chatdrop::parse_object_url(object)?;

            let mut event = TriggerEvent::new(bucket, key);
            event.content_type = content_type.clone();

            (
                Pipeline::new(factory.config().clone(), storage),
                vec![event],
            )
        }
        Command::Event { file } => {
            let json = match file {
                Some(path) => std::fs::read_to_string(path)
                    .wrap_err_with(|| format!("Reading event notification '{}'", path.display()))?,
                None => {
                    let mut json = String::new();
                    std::io::stdin()
                        .read_to_string(&mut json)
                        .wrap_err("Reading event notification from stdin")?;
                    json
                }
            };

            (
                Pipeline::from_config(args.globals.config.clone()).await,
                TriggerEvent::from_s3_notification(&json)?,
            )
        }
    };

    if events.is_empty() {
        tracing::warn!("The event notification has no object creation records");
    }

    // Each event is independent of the others, so keep going after a failure and report all of
    // them at the end
    let mut failed = 0;
    for event in &events {
        match progress::run_pipeline(&args.globals, &pipeline, event).await {
            Ok(outcome) => report(&args.globals, event, &outcome),
            Err(e) => {
                failed += 1;
                eprintln!(
                    "Processing 's3://{}/{}' failed: {:?}",
                    event.bucket,
                    event.key,
                    color_eyre::Report::new(e)
                );
            }
        }
    }

    if failed > 0 {
        return Err(eyre!("{failed} of {} objects failed to process", events.len()));
    }

    Ok(())
}

fn report(globals: &Globals, event: &TriggerEvent, outcome: &PipelineOutcome) {
    if globals.quiet {
        return;
    }

    match outcome {
        PipelineOutcome::Skipped(reason) => {
            println!("Skipped 's3://{}/{}': {reason}", event.bucket, event.key);
        }
        PipelineOutcome::Extracted { upload, published } => {
            println!(
                "Published {} files to '{}'",
                published.uploaded,
                upload.extracted_prefix()
            );
        }
        PipelineOutcome::Mirrored {
            upload,
            published,
            copied,
        } => {
            println!(
                "Published {} files to '{}' and mirrored {} objects to '{}'",
                published.uploaded,
                upload.extracted_prefix(),
                copied.objects,
                upload.chats_prefix()
            );
        }
    }
}

fn init_logging(globals: &Globals) -> color_eyre::Result<()> {
    use tracing_subscriber::{fmt, EnvFilter};

    let default_filter = if globals.verbose {
        "h2=warn,hyper=info,aws=info,chatdrop=debug,info"
    } else if globals.quiet {
        "error"
    } else {
        "warn"
    };

    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(default_filter))?;

    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(globals.verbose)
        .init();

    Ok(())
}
