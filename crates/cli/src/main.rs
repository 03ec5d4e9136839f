use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use imlib_core::{
    app_paths, check_version, clean_leftovers, load_config, persist_undo, save_config, undo_last,
    AppConfig, Catalog, ExifTool, FileMove, ImportOptions, Importer, ItemError, NameIndex,
    Organizer, TagTool, TRASH_DIR,
};
use log::{info, LevelFilter};
use serde::Serialize;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(name = "imlib")]
#[command(about = "Keeps a photo catalog and its XMP sidecars synchronized and canonically named")]
struct Cli {
    /// -v info, -vv debug, -vvv trace
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,
    #[arg(long, value_enum, default_value_t = OutputFormat::Table, global = true)]
    output: OutputFormat,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Synchronize tags and rename every item of the catalog
    Org(OrgArgs),
    /// Bring media from a directory outside the catalog into it
    Import(ImportArgs),
    /// Move sidecars without media into the catalog trash
    Clean(OrgArgs),
    /// Revert the moves of the last run
    Undo,
    /// Verify that exiftool is usable
    Check,
    Config(ConfigArgs),
}

#[derive(Debug, Args)]
struct CatalogArg {
    /// Catalog directory; remembered as the default for later runs
    #[arg(
        short = 'c',
        long = "catalog",
        visible_short_alias = 'l',
        visible_alias = "library"
    )]
    catalog: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct OrgArgs {
    #[command(flatten)]
    catalog: CatalogArg,
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct ImportArgs {
    source: PathBuf,
    #[command(flatten)]
    catalog: CatalogArg,
    /// Copy instead of moving the source files
    #[arg(long, default_value_t = false)]
    copy: bool,
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct ConfigArgs {
    #[command(subcommand)]
    action: ConfigAction,
}

#[derive(Debug, Subcommand)]
enum ConfigAction {
    Show,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let clean = match cli.command {
        Commands::Org(args) => cmd_org(args, cli.output)?,
        Commands::Import(args) => cmd_import(args, cli.output)?,
        Commands::Clean(args) => cmd_clean(args, cli.output)?,
        Commands::Undo => cmd_undo()?,
        Commands::Check => cmd_check()?,
        Commands::Config(config) => match config.action {
            ConfigAction::Show => cmd_config_show()?,
        },
    };

    Ok(if clean {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(2)
    })
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .format(|buf, record| writeln!(buf, "{} {}", record.level(), record.args()))
        .init();
}

/// Picks the catalog from the command line or the config, remembering a
/// command-line choice.
fn resolve_catalog(arg: CatalogArg, config: &mut AppConfig) -> Result<PathBuf> {
    match arg.catalog {
        Some(path) => {
            let path = fs::canonicalize(&path)
                .with_context(|| format!("catalog {} does not exist", path.display()))?;
            if config.catalog.as_deref() != Some(path.as_path()) {
                config.catalog = Some(path.clone());
                save_config(config)?;
                info!("remembered {} as the default catalog", path.display());
            }
            Ok(path)
        }
        None => config
            .catalog
            .clone()
            .context("no catalog given; pass -c <path> once to remember one"),
    }
}

fn open_tool(config: &AppConfig) -> Result<Box<dyn TagTool>> {
    let tool: Box<dyn TagTool> = if config.persistent {
        Box::new(ExifTool::persistent(
            &config.exiftool,
            config.effective_workers(),
        )?)
    } else {
        Box::new(ExifTool::process(&config.exiftool, config.timeout()))
    };
    let version = check_version(tool.as_ref())
        .with_context(|| format!("{} is not usable", config.exiftool.display()))?;
    info!("using exiftool {version}");
    Ok(tool)
}

fn cmd_org(args: OrgArgs, output: OutputFormat) -> Result<bool> {
    let mut config = load_config()?;
    let root = resolve_catalog(args.catalog, &mut config)?;
    let tool = open_tool(&config)?;
    let namer = config.namer()?;
    let index = NameIndex::new();
    let organizer = Organizer::new(
        tool.as_ref(),
        &namer,
        &index,
        config.organize_options(args.dry_run),
    );

    let mut catalog = Catalog::open(&root, &config.scan_options())?;
    let report = organizer.organize(&mut catalog);
    if !args.dry_run {
        persist_undo(Some(catalog.root()), &report.moves)?;
    }

    match output {
        OutputFormat::Json => print_json(&report)?,
        OutputFormat::Table => {
            print_moves(&report.moves);
            println!(
                "\nsummary: processed={} writes={} sidecars_created={} renamed={} \
                 stable={} trashed={} errors={}",
                report.processed,
                report.writes,
                report.sidecars_created,
                report.renamed,
                report.stable,
                report.trashed,
                report.errors.len()
            );
            print_errors(&report.errors);
            print_dry_run_note(args.dry_run);
        }
    }
    Ok(report.errors.is_empty())
}

fn cmd_import(args: ImportArgs, output: OutputFormat) -> Result<bool> {
    let mut config = load_config()?;
    let root = resolve_catalog(args.catalog, &mut config)?;
    let tool = open_tool(&config)?;
    let namer = config.namer()?;
    let index = NameIndex::new();
    let organizer = Organizer::new(
        tool.as_ref(),
        &namer,
        &index,
        config.organize_options(args.dry_run),
    );

    let mut catalog = Catalog::open(&root, &config.scan_options())?;
    let options = ImportOptions {
        copy: args.copy,
        scan: config.scan_options(),
    };
    let report =
        Importer::new(tool.as_ref(), &organizer).import(&mut catalog, &args.source, &options)?;
    if !args.dry_run {
        persist_undo(Some(catalog.root()), &report.all_moves())?;
    }

    let clean = report.errors.is_empty() && report.organized.errors.is_empty();
    match output {
        OutputFormat::Json => print_json(&report)?,
        OutputFormat::Table => {
            print_moves(&report.all_moves());
            println!(
                "\nsummary: imported={} writes={} renamed={} trashed={} errors={}",
                report.imported,
                report.organized.writes,
                report.organized.renamed,
                report.organized.trashed,
                report.errors.len() + report.organized.errors.len()
            );
            print_errors(&report.errors);
            print_errors(&report.organized.errors);
            print_dry_run_note(args.dry_run);
        }
    }
    Ok(clean)
}

fn cmd_clean(args: OrgArgs, output: OutputFormat) -> Result<bool> {
    let mut config = load_config()?;
    let root = resolve_catalog(args.catalog, &mut config)?;
    let catalog = Catalog::open(&root, &config.scan_options())?;
    let report = clean_leftovers(&catalog, args.dry_run);
    if !args.dry_run {
        persist_undo(Some(catalog.root()), &report.moves)?;
    }

    match output {
        OutputFormat::Json => print_json(&report)?,
        OutputFormat::Table => {
            print_moves(&report.moves);
            println!(
                "\nsummary: moved_to_{}={} errors={}",
                TRASH_DIR.trim_start_matches('.'),
                report.moves.len(),
                report.errors.len()
            );
            print_errors(&report.errors);
            print_dry_run_note(args.dry_run);
        }
    }
    Ok(report.errors.is_empty())
}

fn cmd_undo() -> Result<bool> {
    let result = undo_last()?;
    println!("restored {} files ({} skipped)", result.restored, result.skipped);
    Ok(result.skipped == 0)
}

fn cmd_check() -> Result<bool> {
    let config = load_config()?;
    let _tool = open_tool(&config)?;
    println!("exiftool: {} ok", config.exiftool.display());
    Ok(true)
}

fn cmd_config_show() -> Result<bool> {
    let config = load_config()?;
    let paths = app_paths()?;
    println!("config file: {}", paths.config_path.display());
    println!("{}", toml::to_string_pretty(&config)?);
    Ok(true)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_moves(moves: &[FileMove]) {
    for m in moves {
        println!("{} -> {}", m.from.display(), display_relative(&m.to, &m.from));
    }
}

/// Shows `to` relative to the directory of `from` when it lies below it.
fn display_relative(to: &Path, from: &Path) -> String {
    from.parent()
        .and_then(|dir| to.strip_prefix(dir).ok())
        .map(|rel| rel.display().to_string())
        .unwrap_or_else(|| to.display().to_string())
}

fn print_errors(errors: &[ItemError]) {
    for error in errors {
        println!("error: {}", error.error);
    }
}

fn print_dry_run_note(dry_run: bool) {
    if dry_run {
        eprintln!("dry run: no file was written or moved");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn library_alias_selects_catalog() {
        let cli = Cli::try_parse_from(["imlib", "clean", "-l", "/photos", "--dry-run"])
            .expect("parse");
        match cli.command {
            Commands::Clean(args) => {
                assert_eq!(args.catalog.catalog, Some(PathBuf::from("/photos")));
                assert!(args.dry_run);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn import_takes_source_and_flags() {
        let cli = Cli::try_parse_from([
            "imlib", "-vv", "import", "/card", "-c", "/photos", "--copy", "--output", "json",
        ])
        .expect("parse");
        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.output, OutputFormat::Json);
        match cli.command {
            Commands::Import(args) => {
                assert_eq!(args.source, PathBuf::from("/card"));
                assert_eq!(args.catalog.catalog, Some(PathBuf::from("/photos")));
                assert!(args.copy);
                assert!(!args.dry_run);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn relative_display_within_source_directory() {
        assert_eq!(
            display_relative(Path::new("/c/2024/01/x.jpg"), Path::new("/c/a.jpg")),
            "2024/01/x.jpg"
        );
        assert_eq!(
            display_relative(Path::new("/other/x.jpg"), Path::new("/c/a.jpg")),
            "/other/x.jpg"
        );
    }
}
