use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use log::{debug, info};
use std::io;
use std::path::PathBuf;

use ocibuild::tar_extractor::UidRange;
use ocibuild::{BuildMode, BuildSession, Notifier, SessionConfig};

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
enum Mode {
    Oci,
    Flat,
}

impl From<Mode> for BuildMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Oci => BuildMode::Oci,
            Mode::Flat => BuildMode::Flat,
        }
    }
}

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[arg(
        short,
        long,
        global = true,
        env = "OCIBUILD_CONTEXT",
        default_value = ".ocibuild",
        help = "Build context directory holding the image, expanded layers and lock"
    )]
    context: PathBuf,

    #[arg(long, global = true, help = "Override the OCI image directory")]
    image: Option<PathBuf>,

    #[arg(long, global = true, help = "Override the expanded layers directory")]
    expanded: Option<PathBuf>,

    #[arg(
        short,
        long,
        global = true,
        value_enum,
        default_value = "oci",
        help = "Build mode of this session"
    )]
    mode: Mode,

    #[arg(
        long,
        global = true,
        default_value_t = 0,
        help = "First host UID/GID used when extracting unprivileged"
    )]
    uid_shift: u32,

    #[arg(
        long,
        global = true,
        default_value_t = 0,
        help = "Size of the UID/GID range used when extracting unprivileged (0 keeps files owned by you)"
    )]
    uid_count: u32,

    #[arg(
        short,
        long,
        global = true,
        action = clap::ArgAction::Count,
        help = "Verbose mode (-v for info, -vv for debug, -vvv for trace)"
    )]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create an empty image in the context
    Init {
        #[arg(long, help = "Ref name recorded in index.json")]
        ref_name: Option<String>,
    },
    /// Print the manifest (or config) as JSON
    Print {
        #[arg(long, help = "Print the config instead of the manifest")]
        config: bool,
        #[arg(long, help = "Indent the output")]
        pretty: bool,
    },
    /// List layer digests and diff IDs, oldest first
    Layers,
    /// Freeze the top layer and start a new empty one
    NewLayer,
    /// Commit the top layer if its working tree is dirty
    Rehash,
    /// Expand the top layer, mark it dirty and print its path
    MarkDirty,
    /// Expand the top layer (or every layer) and print the path
    Expand {
        #[arg(long, help = "Extract every layer, not only the top one")]
        all: bool,
    },
    /// Remove blobs no longer reachable from the image
    Gc,
    /// Set an environment variable in the image config
    SetEnv { key: String, value: String },
    /// Replace the entrypoint
    SetEntrypoint {
        #[arg(trailing_var_arg = true)]
        args: Vec<String>,
    },
    /// Manage config labels
    Label {
        #[command(subcommand)]
        action: LabelAction,
    },
}

#[derive(Subcommand)]
enum LabelAction {
    Add { key: String, value: String },
    Rm { key: String },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut notifier = Notifier::init(cli.verbose);

    let mut config = SessionConfig::from_context(&cli.context).with_mode(cli.mode.into());
    if let Some(image) = cli.image {
        config.image_dir = image;
    }
    if let Some(expanded) = cli.expanded {
        config.expanded_dir = expanded;
    }
    config.uid_range = UidRange {
        shift: cli.uid_shift,
        count: cli.uid_count,
    };

    debug!("Image directory: {}", config.image_dir.display());
    debug!("Expanded directory: {}", config.expanded_dir.display());
    debug!("Mode: {:?}", config.mode);

    let mut session = BuildSession::new(config);

    match cli.command {
        Command::Init { ref_name } => {
            session
                .init_image(ref_name.as_deref())
                .context("Failed to initialize image")?;
            info!("Initialized {}", session.image_dir().display());
        }
        Command::Print { config, pretty } => {
            let image = session.load_image().context("Failed to load image")?;
            image.print(&mut io::stdout().lock(), pretty, config)?;
        }
        Command::Layers => {
            let image = session.load_image().context("Failed to load image")?;
            for (digest, diff_id) in image.layer_digests().iter().zip(image.diff_ids()) {
                println!("{} {}", digest, diff_id);
            }
        }
        Command::NewLayer => {
            notifier.step("Starting new layer");
            let digest = session.new_layer().context("Failed to start a new layer")?;
            notifier.finish(&format!("New top layer {}", digest));
        }
        Command::Rehash => {
            notifier.step("Rehashing top layer");
            let rehashed = session
                .rehash_top_layer()
                .context("Failed to rehash the top layer")?;
            notifier.finish(if rehashed {
                "Top layer updated"
            } else {
                "Top layer unchanged"
            });
        }
        Command::MarkDirty => {
            let dir = session.open_top_layer().context("Failed to open top layer")?;
            println!("{}", dir.display());
        }
        Command::Expand { all } => {
            if all {
                let report = session
                    .expand_all_layers(|current, total, digest| {
                        notifier.layer_progress(current, total, &digest.to_string())
                    })
                    .context("Failed to expand layers")?;
                for digest in session.load_image()?.layer_digests() {
                    println!("{}", session.layer_dir(&digest).display());
                }
                notifier.finish(&format!(
                    "Expanded {} layers ({} already on disk)",
                    report.extracted.len(),
                    report.cached.len()
                ));
            } else {
                let dir = session
                    .expand_top_layer()
                    .context("Failed to expand top layer")?;
                println!("{}", dir.display());
            }
        }
        Command::Gc => {
            let summary = session.with_lock(|s| s.load_image()?.collect_garbage())?;
            if summary.skipped {
                println!("skipped: image references content that cannot be walked");
            } else {
                println!(
                    "removed {} blobs ({} bytes), kept {}",
                    summary.removed, summary.reclaimed_bytes, summary.kept
                );
            }
        }
        Command::SetEnv { key, value } => {
            session.update_image(|image| image.set_env(&key, &value))?;
        }
        Command::SetEntrypoint { args } => {
            session.update_image(|image| image.set_entrypoint(args))?;
        }
        Command::Label { action } => match action {
            LabelAction::Add { key, value } => {
                session.update_image(|image| image.add_label(&key, &value))?;
            }
            LabelAction::Rm { key } => {
                session.update_image(|image| image.remove_label(&key))?;
            }
        },
    }

    Ok(())
}
