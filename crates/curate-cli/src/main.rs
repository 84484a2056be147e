// SPDX-License-Identifier: Apache-2.0
// Copyright © 2025 The spb-curate Authors.

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use curate_client::{
    CancellationToken, Client, ClientConfig, Credentials, DatasetId, Error, ImageRef,
    ImportOptions, JobId, PollOptions, Progress, SliceId, SliceImages, discover_images,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::{path::PathBuf, time::Duration};
use tokio::sync::mpsc;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Curate access key
    #[clap(long, env = "SPB_ACCESS_KEY", hide_env_values = true)]
    access_key: Option<String>,

    /// Curate team name
    #[clap(long, env = "SPB_TEAM_NAME")]
    team_name: Option<String>,

    /// Curate API base URL
    #[clap(long, env = "SPB_API_BASE")]
    api_base: Option<String>,

    /// Client Command
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, PartialEq, Clone, Debug)]
enum Command {
    /// Create a new dataset.
    CreateDataset {
        /// Dataset name
        name: String,

        /// Dataset description
        #[clap(long)]
        description: Option<String>,
    },
    /// Retrieve dataset information for the provided dataset ID.
    Dataset {
        /// Dataset ID
        dataset_id: String,
    },
    /// Delete a dataset.
    DeleteDataset {
        /// Dataset ID
        dataset_id: String,
    },
    /// Create a slice in a dataset.
    CreateSlice {
        /// Dataset ID
        dataset_id: String,

        /// Slice name
        name: String,

        /// Slice description
        #[clap(long)]
        description: Option<String>,
    },
    /// Add images to a slice, or remove them with --remove.  Images are
    /// selected by key or by a Curate query.
    SliceImages {
        /// Dataset ID
        dataset_id: String,

        /// Slice ID
        slice_id: String,

        /// Image keys
        #[clap(long, value_delimiter = ',', required_unless_present = "query", conflicts_with = "query")]
        keys: Vec<String>,

        /// Curate query selecting the images
        #[clap(long)]
        query: Option<String>,

        /// Remove the images from the slice
        #[clap(long)]
        remove: bool,
    },
    /// Upload every image in a directory and import them into a dataset.
    /// Image keys are the paths relative to the directory.  Press Ctrl-C to
    /// stop starting new uploads; uploads already in flight are finished.
    UploadImages {
        /// Dataset ID
        dataset_id: String,

        /// Directory containing the images
        dir: PathBuf,

        /// Descend into subdirectories
        #[clap(long, short)]
        recursive: bool,

        /// Add the imported images to this slice
        #[clap(long)]
        slice: Option<String>,

        /// Maximum number of concurrent uploads
        #[clap(long)]
        max_concurrency: Option<usize>,

        /// Wait for the import job to complete
        #[clap(long)]
        wait: bool,

        /// Seconds to wait for the import job
        #[clap(long)]
        timeout: Option<u64>,
    },
    /// Delete images from a dataset by key.
    DeleteImages {
        /// Dataset ID
        dataset_id: String,

        /// Image keys to delete
        #[clap(required = true, value_delimiter = ',')]
        keys: Vec<String>,
    },
    /// Retrieve job information for the provided job ID.
    Job {
        /// Job ID
        job_id: String,
    },
    /// Wait for a job to reach a terminal status.  Timing out does not
    /// cancel the job, run the command again to keep waiting.
    WaitJob {
        /// Job ID
        job_id: String,

        /// Seconds between status checks
        #[clap(long, default_value = "2")]
        interval: u64,

        /// Seconds to wait before giving up
        #[clap(long, default_value = "300")]
        timeout: u64,
    },
    /// List jobs, optionally only those created since an RFC 3339 date.
    Jobs {
        /// Earliest creation date, for example 2025-01-31T00:00:00Z
        #[clap(long)]
        from_date: Option<DateTime<Utc>>,
    },
}

fn progress_bar() -> ProgressBar {
    let bar = ProgressBar::new(0);
    let style = ProgressStyle::with_template(
        "[{elapsed_precise} ETA: {eta}] {msg}: {wide_bar:.yellow} {human_pos}/{human_len}",
    )
    .map(|style| style.progress_chars("█▇▆▅▄▃▂▁  "))
    .unwrap_or_else(|_| ProgressStyle::default_bar());
    bar.set_style(style);
    bar
}

async fn handle_create_dataset(
    client: &Client,
    name: String,
    description: Option<String>,
) -> Result<(), Error> {
    let dataset = client
        .create_dataset(&name, description.as_deref().unwrap_or_default())
        .await?;
    println!("Created dataset with ID: {}", dataset.id());
    Ok(())
}

async fn handle_dataset(client: &Client, dataset_id: String) -> Result<(), Error> {
    let dataset_id: DatasetId = dataset_id.try_into()?;
    let dataset = client.dataset(&dataset_id).await?;
    println!("[{}] {}: {}", dataset.id(), dataset.name(), dataset.description());
    if let Some(count) = dataset.image_count() {
        println!("    Images: {}", count);
    }
    if let Some(created_at) = dataset.created_at() {
        println!("    Created: {}", created_at.to_rfc3339());
    }
    Ok(())
}

async fn handle_delete_dataset(client: &Client, dataset_id: String) -> Result<(), Error> {
    let dataset_id: DatasetId = dataset_id.try_into()?;
    client.delete_dataset(&dataset_id).await?;
    println!("Dataset {} deleted", dataset_id);
    Ok(())
}

async fn handle_create_slice(
    client: &Client,
    dataset_id: String,
    name: String,
    description: Option<String>,
) -> Result<(), Error> {
    let dataset_id: DatasetId = dataset_id.try_into()?;
    let slice = client
        .create_slice(&dataset_id, &name, description.as_deref().unwrap_or_default())
        .await?;
    println!("Created slice with ID: {}", slice.id());
    Ok(())
}

async fn handle_slice_images(
    client: &Client,
    dataset_id: String,
    slice_id: String,
    keys: Vec<String>,
    query: Option<String>,
    remove: bool,
) -> Result<(), Error> {
    let dataset_id: DatasetId = dataset_id.try_into()?;
    let slice_id: SliceId = slice_id.try_into()?;
    let images = match query {
        Some(query) => SliceImages::Query(query),
        None => SliceImages::Images(keys.into_iter().map(ImageRef::key).collect()),
    };
    let job = if remove {
        client
            .remove_images_from_slice(&dataset_id, &slice_id, &images)
            .await?
    } else {
        client
            .add_images_to_slice(&dataset_id, &slice_id, &images)
            .await?
    };
    println!("Slice update job: {}", job.job());
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn handle_upload_images(
    client: &Client,
    dataset_id: String,
    dir: PathBuf,
    recursive: bool,
    slice: Option<String>,
    max_concurrency: Option<usize>,
    wait: bool,
    timeout: Option<u64>,
) -> Result<(), Error> {
    let dataset_id: DatasetId = dataset_id.try_into()?;

    let mut client = client.clone();
    if let Some(n) = max_concurrency {
        client = client.with_upload_options(client.upload_options().clone().with_max_concurrency(n));
    }
    if let Some(secs) = timeout {
        client = client.with_poll_options(client.poll_options().with_timeout(Duration::from_secs(secs)));
    }

    let assets = discover_images(&dir, recursive)?;
    if assets.is_empty() {
        return Err(Error::InvalidParameters(format!(
            "no image files in {}",
            dir.display()
        )));
    }

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Interrupted, finishing uploads in flight");
            on_interrupt.cancel();
        }
    });

    let bar = progress_bar();
    bar.set_message("Uploading");
    let (tx, mut rx) = mpsc::channel::<Progress>(16);
    let reporter = bar.clone();
    tokio::spawn(async move {
        while let Some(progress) = rx.recv().await {
            if progress.total > 0 {
                reporter.set_length(progress.total as u64);
                reporter.set_position(progress.current as u64);
            }
        }
    });

    let mut options = ImportOptions::default().with_wait(wait).with_cancel(cancel);
    if let Some(slice) = &slice {
        options = options.with_slice(slice);
    }

    let import = client
        .add_images(&dataset_id, &assets, options, Some(tx))
        .await?;
    bar.finish_and_clear();

    for (asset, result) in assets.iter().zip(&import.results) {
        if let Some(failure) = result.failure() {
            eprintln!("{}: {}", asset.key(), failure);
        }
    }
    println!("{}", import.summary);

    if let Some(job) = &import.job {
        println!("Import job: {}", job.job());
    }
    match import.wait {
        Some(Ok(job)) => println!("{}", job),
        Some(Err(err)) => return Err(err),
        None => {}
    }
    Ok(())
}

async fn handle_delete_images(
    client: &Client,
    dataset_id: String,
    keys: Vec<String>,
) -> Result<(), Error> {
    let dataset_id: DatasetId = dataset_id.try_into()?;
    let images = keys.into_iter().map(ImageRef::key).collect::<Vec<_>>();
    let job = client.delete_images(&dataset_id, &images).await?;
    println!("Delete job: {}", job.job());
    Ok(())
}

async fn handle_job(client: &Client, job_id: String) -> Result<(), Error> {
    let job_id: JobId = job_id.try_into()?;
    let job = client.job(&job_id).await?;
    println!("{}", job);
    if let Some(progress) = job.progress() {
        println!(
            "    Progress: {}/{} succeeded, {} failed",
            progress.success_count, progress.total_count, progress.fail_count
        );
    }
    if let Some(result) = job.result() {
        println!("    Result: {}", result);
    }
    Ok(())
}

async fn handle_wait_job(
    client: &Client,
    job_id: String,
    interval: u64,
    timeout: u64,
) -> Result<(), Error> {
    let job_id: JobId = job_id.try_into()?;
    let poll = PollOptions::default()
        .with_interval(Duration::from_secs(interval))
        .with_timeout(Duration::from_secs(timeout));

    let mut handle = client.job_handle(&job_id).await?;
    let job = handle
        .wait_until_complete(poll.interval(), poll.timeout())
        .await?;
    println!("{}", job);
    Ok(())
}

async fn handle_jobs(client: &Client, from_date: Option<DateTime<Utc>>) -> Result<(), Error> {
    for job in client.jobs(from_date).await? {
        match job.created_at() {
            Some(created_at) => println!("{} {}", created_at.to_rfc3339(), job),
            None => println!("{}", job),
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = ClientConfig::from_env()?;
    let config = match args.api_base {
        Some(api_base) => config.with_api_base(&api_base),
        None => config,
    };

    // Flags override the environment and ~/.spb/config field by field.
    let credentials = match (args.access_key, args.team_name, config.credentials.clone()) {
        (Some(access_key), Some(team_name), _) => Some(Credentials::new(access_key, team_name)),
        (access_key, team_name, Some(existing)) => Some(Credentials::new(
            access_key.unwrap_or_else(|| existing.access_key().to_owned()),
            team_name.unwrap_or_else(|| existing.team_name().to_owned()),
        )),
        _ => None,
    };
    let config = match credentials {
        Some(credentials) => config.with_credentials(credentials),
        None => config,
    };

    let client = Client::from_config(config)?;

    match args.cmd {
        Command::CreateDataset { name, description } => {
            handle_create_dataset(&client, name, description).await
        }
        Command::Dataset { dataset_id } => handle_dataset(&client, dataset_id).await,
        Command::DeleteDataset { dataset_id } => handle_delete_dataset(&client, dataset_id).await,
        Command::CreateSlice {
            dataset_id,
            name,
            description,
        } => handle_create_slice(&client, dataset_id, name, description).await,
        Command::SliceImages {
            dataset_id,
            slice_id,
            keys,
            query,
            remove,
        } => handle_slice_images(&client, dataset_id, slice_id, keys, query, remove).await,
        Command::UploadImages {
            dataset_id,
            dir,
            recursive,
            slice,
            max_concurrency,
            wait,
            timeout,
        } => {
            handle_upload_images(
                &client,
                dataset_id,
                dir,
                recursive,
                slice,
                max_concurrency,
                wait,
                timeout,
            )
            .await
        }
        Command::DeleteImages { dataset_id, keys } => {
            handle_delete_images(&client, dataset_id, keys).await
        }
        Command::Job { job_id } => handle_job(&client, job_id).await,
        Command::WaitJob {
            job_id,
            interval,
            timeout,
        } => handle_wait_job(&client, job_id, interval, timeout).await,
        Command::Jobs { from_date } => handle_jobs(&client, from_date).await,
    }
}
