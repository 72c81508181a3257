use clap::Parser;

use kachina::builder::{self, ExtractAction};
use kachina::cli::{BuilderCli, BuilderCommand, GenArgs, PackArgs};
use kachina::errors::{InstallerError, Result};
use kachina::models::{HashAlgorithm, Manifest};
use kachina::package::{pack, PackInputs};

fn main() {
    let cli = BuilderCli::parse();
    let log_dir = std::env::temp_dir().join("kachina").join("logs");
    let _ = kachina::logging::init(&log_dir, false);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("tokio runtime");
    let started = std::time::Instant::now();
    let result = runtime.block_on(async {
        match cli.command {
            BuilderCommand::Pack(args) => run_pack(args).await,
            BuilderCommand::Gen(args) => run_gen(args).await,
            BuilderCommand::Extract(args) => run_extract(args).await,
        }
    });
    match result {
        Ok(()) => println!("finished in {:?}", started.elapsed()),
        Err(err) => {
            eprintln!("error: {}", err.user_message());
            std::process::exit(err.exit_code());
        }
    }
}

async fn run_pack(args: PackArgs) -> Result<()> {
    let config: serde_json::Value = serde_json::from_slice(&tokio::fs::read(&args.config).await?)?;
    let metadata: Option<Manifest> = match &args.metadata {
        Some(path) => Some(serde_json::from_slice(&tokio::fs::read(path).await?)?),
        None => None,
    };
    let theme = match &args.theme {
        Some(path) => Some(tokio::fs::read(path).await?),
        None => None,
    };
    let stub = match args.stub {
        Some(stub) => stub,
        None => std::env::current_exe()?,
    };
    println!(
        "packing: metadata: {}, theme: {}, data dir: {}",
        metadata.is_some(),
        theme.is_some(),
        args.data_dir.is_some(),
    );
    let summary = pack(PackInputs {
        stub,
        config,
        theme,
        metadata,
        hashed_dir: args.data_dir,
        output: args.output,
    })
    .await?;
    println!(
        "packed {} payloads into {} ({} bytes)",
        summary.payload_count,
        summary.output.display(),
        summary.total_size
    );
    Ok(())
}

async fn run_gen(args: GenArgs) -> Result<()> {
    let algorithm = HashAlgorithm::parse(&args.algorithm)?;
    println!("hashing {}", args.input_dir.display());
    let mut hashed =
        builder::hash_tree(&args.input_dir, &args.output_dir, algorithm, args.jobs).await?;
    println!("hashed {} files", hashed.len());

    let installer = match &args.updater {
        Some(updater) => {
            let (info, entry) =
                builder::stage_updater(updater, &args.output_dir, algorithm).await?;
            hashed.push(entry);
            Some(info)
        }
        None => None,
    };

    let (patches, deletes) = if args.diff_dirs.is_empty() {
        (None, None)
    } else {
        println!("diffing against {} prior versions", args.diff_dirs.len());
        let patches = builder::diff_tree(builder::DiffRequest {
            old_dirs: &args.diff_dirs,
            new_dir: &args.input_dir,
            new_files: &hashed,
            output_dir: &args.output_dir,
            algorithm,
        })
        .await?;
        println!("generated {} patches", patches.len());
        let deletes = builder::list_deletes(&args.diff_dirs, &hashed).await?;
        (
            (!patches.is_empty()).then_some(patches),
            (!deletes.is_empty()).then_some(deletes),
        )
    };

    let manifest = Manifest {
        tag_name: args.tag,
        hashed,
        patches,
        deletes,
        installer,
    };
    manifest.validate()?;
    tokio::fs::write(
        &args.output_metadata,
        serde_json::to_vec_pretty(&manifest)?,
    )
    .await?;
    println!("wrote {}", args.output_metadata.display());
    Ok(())
}

async fn run_extract(args: kachina::cli::ExtractArgs) -> Result<()> {
    let action = if args.list {
        ExtractAction::List
    } else if let Some(out_dir) = args.all {
        ExtractAction::All(out_dir)
    } else if let Some(segment) = args.meta_name {
        ExtractAction::MetaName(segment)
    } else if let Some(name) = args.name {
        ExtractAction::Name(name)
    } else {
        return Err(InstallerError::Config("no extract action given".into()));
    };
    builder::extract(&args.input, action).await
}
