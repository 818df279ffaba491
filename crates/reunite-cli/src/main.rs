use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

#[zbus::proxy(
    interface = "org.reunite.Gallery1",
    default_service = "org.reunite.Gallery1",
    default_path = "/org/reunite/Gallery1"
)]
trait Gallery {
    fn register(
        &self,
        full_name: &str,
        contact_info: &str,
        reporter_address: &str,
        missing_place_address: &str,
        identity_details: &str,
        image: &[u8],
    ) -> zbus::Result<String>;
    fn match_image(&self, image: &[u8]) -> zbus::Result<String>;
    fn get_record(&self, id: u64) -> zbus::Result<String>;
    fn replace_image(&self, id: u64, image: &[u8]) -> zbus::Result<String>;
    fn remove_record(&self, id: u64) -> zbus::Result<bool>;
    fn status(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "reunite", about = "Reunite missing-person gallery CLI")]
struct Cli {
    /// Talk to the daemon on the system bus instead of the session bus
    #[arg(long, global = true)]
    system: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register a missing person
    Register {
        #[arg(long)]
        name: String,
        /// How to reach the reporter
        #[arg(long)]
        contact: String,
        #[arg(long)]
        reporter_address: String,
        /// Where the person was last seen
        #[arg(long)]
        missing_place: String,
        /// Distinguishing features, clothing, etc.
        #[arg(long)]
        details: String,
        /// Reference photo
        #[arg(long)]
        image: Option<PathBuf>,
    },
    /// Search the gallery with a photo
    Match {
        image: PathBuf,
    },
    /// Show a registered record
    Show {
        id: u64,
    },
    /// Replace a record's photo, or remove it when no image is given
    ReplaceImage {
        id: u64,
        image: Option<PathBuf>,
    },
    /// Remove a record
    Remove {
        id: u64,
    },
    /// Show daemon status
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    tracing::debug!(system = cli.system, "connecting to reunited");

    let connection = if cli.system {
        zbus::Connection::system().await
    } else {
        zbus::Connection::session().await
    }
    .context("failed to connect to D-Bus")?;
    let gallery = GalleryProxy::new(&connection)
        .await
        .context("reunited is not reachable on D-Bus")?;

    let body = match cli.command {
        Commands::Register {
            name,
            contact,
            reporter_address,
            missing_place,
            details,
            image,
        } => {
            let image = read_optional(image.as_deref())?;
            gallery
                .register(&name, &contact, &reporter_address, &missing_place, &details, &image)
                .await?
        }
        Commands::Match { image } => gallery.match_image(&read_image(&image)?).await?,
        Commands::Show { id } => gallery.get_record(id).await?,
        Commands::ReplaceImage { id, image } => {
            let image = read_optional(image.as_deref())?;
            gallery.replace_image(id, &image).await?
        }
        Commands::Remove { id } => {
            let removed = gallery.remove_record(id).await?;
            serde_json::json!({ "removed": removed }).to_string()
        }
        Commands::Status => gallery.status().await?,
    };

    println!("{}", pretty(&body));
    Ok(())
}

fn read_image(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))
}

/// Missing path means "no image", sent as an empty array.
fn read_optional(path: Option<&Path>) -> Result<Vec<u8>> {
    path.map(read_image).transpose().map(Option::unwrap_or_default)
}

/// Pretty-print a JSON body; anything that does not parse is shown as is.
fn pretty(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|value| serde_json::to_string_pretty(&value).ok())
        .unwrap_or_else(|| body.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_subcommands() {
        let cli = Cli::parse_from(["reunite", "replace-image", "7"]);
        assert!(matches!(cli.command, Commands::ReplaceImage { id: 7, image: None }));

        let cli = Cli::parse_from(["reunite", "--system", "match", "photo.jpg"]);
        assert!(cli.system);
        assert!(matches!(cli.command, Commands::Match { ref image } if image == Path::new("photo.jpg")));
    }

    #[test]
    fn test_register_requires_fields() {
        assert!(Cli::try_parse_from(["reunite", "register", "--name", "Jane"]).is_err());
    }

    #[test]
    fn test_pretty() {
        assert_eq!(pretty(r#"{"id":1}"#), "{\n  \"id\": 1\n}");
        assert_eq!(pretty("not json"), "not json");
    }

    #[test]
    fn test_read_optional_none_is_empty() {
        assert!(read_optional(None).unwrap().is_empty());
    }
}
