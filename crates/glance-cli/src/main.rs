use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use reqwest::header::CONTENT_TYPE;
use reqwest::multipart::{Form, Part};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "glance", about = "Glance face recognition CLI")]
struct Cli {
    /// Base URL of the glanced server
    #[arg(long, global = true, default_value = "http://127.0.0.1:8090")]
    server: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Upload an enrollment image for a user
    Enroll {
        /// User id to enroll the image under
        #[arg(short, long)]
        user: String,
        /// Image file to upload
        #[arg(short, long)]
        image: PathBuf,
        /// Display name stored with the user
        #[arg(long)]
        name: Option<String>,
        /// Role stored with the user
        #[arg(long)]
        role: Option<String>,
        /// Age stored with the user
        #[arg(long)]
        age: Option<String>,
    },
    /// Rebuild the recognition gallery from all enrolled images
    Train,
    /// Recognize faces in an image
    Recognize {
        /// Image file to recognize
        #[arg(short, long)]
        image: PathBuf,
    },
    /// List enrolled users
    List,
    /// Delete every enrolled user and the trained gallery
    Reset {
        /// Confirm the deletion
        #[arg(long)]
        yes: bool,
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
    let client = reqwest::Client::new();
    let server = cli.server;

    let response = match cli.command {
        Commands::Enroll {
            user,
            image,
            name,
            role,
            age,
        } => {
            let bytes = std::fs::read(&image)
                .with_context(|| format!("reading {}", image.display()))?;
            let filename = image
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "capture.jpg".to_string());

            let mut form = Form::new()
                .part("file", Part::bytes(bytes).file_name(filename))
                .text("user_id", user);
            if let Some(name) = name {
                form = form.text("name", name);
            }
            if let Some(role) = role {
                form = form.text("role", role);
            }
            if let Some(age) = age {
                form = form.text("age", age);
            }

            client
                .post(format!("{server}/upload"))
                .multipart(form)
                .send()
                .await?
        }
        Commands::Train => client.post(format!("{server}/train")).send().await?,
        Commands::Recognize { image } => {
            let bytes = std::fs::read(&image)
                .with_context(|| format!("reading {}", image.display()))?;
            client
                .post(format!("{server}/recognize"))
                .header(CONTENT_TYPE, "application/octet-stream")
                .body(bytes)
                .send()
                .await?
        }
        Commands::List => client.get(format!("{server}/ids")).send().await?,
        Commands::Reset { yes } => {
            if !yes {
                bail!("reset deletes every enrolled user and the trained gallery; pass --yes to confirm");
            }
            client.post(format!("{server}/reset")).send().await?
        }
        Commands::Status => client.get(format!("{server}/status")).send().await?,
    };

    let status = response.status();
    let body: serde_json::Value = response
        .json()
        .await
        .context("server returned a non-JSON response")?;
    println!("{}", serde_json::to_string_pretty(&body)?);

    if !status.is_success() {
        bail!("server responded with {status}");
    }
    Ok(())
}
