use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand};
use std::path::PathBuf;

use layerdelta::{compare_images, merge_images, Notifier};

#[derive(Parser)]
#[command(author, version, about = "Container image diff tool", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[arg(
        short,
        long,
        global = true,
        action = clap::ArgAction::Count,
        help = "Verbose mode (-v for info, -vv for debug, -vvv for trace). Also switches to text-based progress"
    )]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Make a diff between two images
    Compare {
        #[arg(long, help = "Base image TAR file")]
        base: PathBuf,

        #[arg(long, help = "New image TAR file")]
        new: PathBuf,

        #[arg(long, help = "Output diff TAR file")]
        output: PathBuf,
    },
    /// Merge a base image and a diff into a new image
    Merge {
        #[arg(long, help = "Base image TAR file")]
        base: PathBuf,

        #[arg(long = "diff-tar", help = "Diff TAR file")]
        diff_tar: PathBuf,

        #[arg(long, help = "Output new image TAR file")]
        output: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let notifier = Notifier::new(cli.verbose);

    match cli.command {
        Some(Commands::Compare { base, new, output }) => {
            notifier.debug(&format!(
                "compare: base={} new={} output={}",
                base.display(),
                new.display(),
                output.display()
            ));
            // A base image without manifest.json is logged and produces no output
            let result = compare_images(&base, &new, &output, &notifier)?;
            notifier.finish();
            if let Some(summary) = result {
                if notifier.use_beautiful_progress() {
                    for line in summary.report_lines() {
                        println!("{}", line);
                    }
                }
            }
        }
        Some(Commands::Merge {
            base,
            diff_tar,
            output,
        }) => {
            let summary = merge_images(&base, &diff_tar, &output, &notifier)
                .inspect_err(|e| notifier.error(&format!("Error during image merge: {:#}", e)))?;
            notifier.finish();
            notifier.debug(&format!(
                "Packed {} files, {} layers declared",
                summary.files_packed, summary.manifest_layers
            ));
        }
        None => {
            Cli::command().print_help()?;
        }
    }

    Ok(())
}
