use anyhow::{Context, Result, anyhow};
use avatar_depot::storage::{self, StoreStatus};
use avatar_depot::{
    AvatarRecord, CategoryFilter, Depot, DraftCategory, ImgbbClient, SettingsPatch, Tab, logger,
};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "avatar-depot", about = "Upload and catalog avatar images", version)]
struct Cli {
    /// Directory holding the local state database
    #[arg(long, value_name = "DIR")]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Upload an image and catalog it
    Upload {
        #[arg(value_name = "FILE")]
        file: PathBuf,
        #[arg(long)]
        category: Option<String>,
    },
    /// Re-upload the image behind an existing avatar
    Replace {
        id: u64,
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },
    /// List avatars, newest first
    List {
        /// Category to show; "ALL" shows everything. Defaults to the saved filter
        #[arg(long)]
        category: Option<String>,
    },
    /// Select an avatar
    Select { id: u64 },
    /// Delete an avatar from the catalog
    Delete { id: u64 },
    /// Print the forum snippet for an avatar
    Link { id: u64 },
    /// Print configured categories
    Categories,
    /// Write the catalog export document
    Export {
        #[arg(long, value_name = "FILE")]
        out: Option<PathBuf>,
    },
    /// Replace the catalog with an export document
    Import {
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },
    /// Read or change settings
    Settings {
        #[command(subcommand)]
        cmd: SettingsCmd,
    },
    /// Show or switch the active tab
    Tab { name: Option<String> },
    /// Keep an unsaved category name around for the next session
    Draft {
        name: Option<String>,
        #[arg(long)]
        open: bool,
    },
    /// Print the restored interface state
    State,
    /// Toggle file logging
    Logging {
        #[command(subcommand)]
        cmd: LoggingCmd,
    },
}

#[derive(Subcommand)]
enum SettingsCmd {
    Get {
        /// Print the merged settings as JSON, key masked
        #[arg(long)]
        json: bool,
    },
    Set {
        /// imgbb API key; an empty value clears it
        #[arg(long)]
        api_key: Option<String>,
        #[arg(long)]
        theme: Option<String>,
    },
    AddCategory { name: String },
}

#[derive(Subcommand)]
enum LoggingCmd {
    Enable,
    Disable,
}

fn report_status(what: &str, status: &StoreStatus) {
    if let StoreStatus::Degraded { reason } = status {
        eprintln!("warning: {what} not fully persisted: {reason}");
    }
}

fn mask_secret(secret: &str) -> String {
    let visible = secret.chars().take(4).collect::<String>();
    format!("{visible}…")
}

fn print_record(record: &AvatarRecord) {
    println!(
        "#{:<4} {:<12} {:>14}  {}",
        record.id, record.category, record.time, record.url
    );
}

fn toggle_logging(cmd: LoggingCmd) -> Result<()> {
    match cmd {
        LoggingCmd::Enable => {
            if !logger::enable_file_logging() {
                return Err(anyhow!("could not enable file logging"));
            }
            if let Some(path) = logger::log_file_path() {
                println!("logging to {}", path.display());
            }
        }
        LoggingCmd::Disable => logger::disable_file_logging(),
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let state_dir = cli.data_dir.unwrap_or_else(storage::local_state_dir);
    logger::initialize(&state_dir);

    match cli.cmd {
        Cmd::Logging { cmd } => toggle_logging(cmd),
        cmd => run(&state_dir, cmd),
    }
}

fn run(state_dir: &Path, cmd: Cmd) -> Result<()> {
    let stores = storage::open_persistent_stores(&storage::db_path_in(state_dir))?;
    let mut depot = Depot::open(stores, ImgbbClient::new()?);
    if depot.records().status().is_degraded() {
        report_status("catalog", depot.records().status());
    }

    match cmd {
        Cmd::Upload { file, category } => {
            let bytes =
                std::fs::read(&file).with_context(|| format!("read {}", file.display()))?;
            let record = depot.upload(&bytes, category.as_deref())?;
            print_record(&record);
            println!("{}", record.forum);
        }
        Cmd::Replace { id, file } => {
            let bytes =
                std::fs::read(&file).with_context(|| format!("read {}", file.display()))?;
            let record = depot.replace(id, &bytes)?;
            print_record(&record);
        }
        Cmd::List { category } => {
            let filter = match category {
                Some(raw) => {
                    let filter = CategoryFilter::parse(&raw);
                    report_status("filter", &depot.set_filter(&filter));
                    filter
                }
                None => depot.restore_ui().filter,
            };
            let records = depot.library(&filter);
            if records.is_empty() {
                println!("No avatars yet.");
            } else {
                println!("{} avatar(s)", records.len());
                records.iter().for_each(print_record);
            }
        }
        Cmd::Select { id } => match depot.select(id) {
            Some(record) => {
                print_record(&record);
                println!("thumb: {}", record.display_thumb());
            }
            None => return Err(anyhow!("no avatar with id {id}")),
        },
        Cmd::Delete { id } => {
            if !depot.delete(id) {
                return Err(anyhow!("no avatar with id {id}"));
            }
            report_status("catalog", depot.records().status());
            println!("Deleted.");
        }
        Cmd::Link { id } => match depot.copy_link(id) {
            Some(link) => println!("{link}"),
            None => return Err(anyhow!("no avatar with id {id}")),
        },
        Cmd::Categories => {
            let categories = depot.categories();
            report_status("categories", &categories.status);
            categories.value.iter().for_each(|name| println!("{name}"));
        }
        Cmd::Export { out } => {
            let document = depot.export_json()?;
            match out {
                Some(path) => std::fs::write(&path, document)
                    .with_context(|| format!("write {}", path.display()))?,
                None => println!("{document}"),
            }
        }
        Cmd::Import { file } => {
            let raw = std::fs::read_to_string(&file)
                .with_context(|| format!("read {}", file.display()))?;
            if !depot.import_json(&raw) {
                return Err(anyhow!("Import failed"));
            }
            println!("Data imported ({} avatars).", depot.records().len());
        }
        Cmd::Settings { cmd } => match cmd {
            SettingsCmd::Get { json } => {
                let settings = depot.settings();
                report_status("settings", &settings.status);
                let mut settings = settings.value;
                settings.imgbb_key = settings.imgbb_key.as_deref().map(mask_secret);
                if json {
                    println!("{}", serde_json::to_string_pretty(&settings)?);
                } else {
                    let key = settings.imgbb_key.as_deref().unwrap_or("(not set)");
                    println!("api key:    {key}");
                    println!("theme:      {}", settings.theme_or_default());
                    println!("categories: {}", settings.categories.join(", "));
                }
            }
            SettingsCmd::Set { api_key, theme } => {
                let updated = depot.update_settings(SettingsPatch {
                    imgbb_key: api_key.map(|key| Some(key.trim().to_string())),
                    theme,
                    ..Default::default()
                });
                report_status("settings", &updated.status);
                println!("Saved");
            }
            SettingsCmd::AddCategory { name } => {
                let categories = depot.add_category(&name);
                report_status("categories", &categories.status);
                println!("{}", categories.value.join(", "));
            }
        },
        Cmd::Tab { name } => match name {
            Some(raw) => {
                let tab = Tab::parse(&raw).ok_or_else(|| anyhow!("unknown tab: {raw}"))?;
                report_status("tab", &depot.switch_tab(tab));
            }
            None => println!("{}", depot.active_tab().as_str()),
        },
        Cmd::Draft { name, open } => {
            let draft = DraftCategory {
                name: name.unwrap_or_default(),
                open,
            };
            report_status("draft", &depot.save_draft_category(&draft));
        }
        Cmd::State => {
            let snapshot = depot.restore_ui();
            println!("tab:      {}", snapshot.active_tab.as_str());
            println!("selected: {:?}", snapshot.selected_id);
            println!("filter:   {}", snapshot.filter.as_str());
            for tab in Tab::ALL {
                println!("scroll:   {} {}", tab.as_str(), snapshot.scroll_offset(tab));
            }
            println!(
                "draft:    {:?} (open: {})",
                snapshot.draft_category.name, snapshot.draft_category.open
            );
            println!(
                "preview:  {}",
                snapshot
                    .preview_png
                    .as_ref()
                    .map(|png| format!("{} bytes", png.len()))
                    .unwrap_or_else(|| "none".to_string())
            );
        }
        Cmd::Logging { cmd } => toggle_logging(cmd)?,
    }

    report_status("interface state", &depot.close());
    Ok(())
}
