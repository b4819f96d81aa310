use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::sync::broadcast::error::RecvError;

use clipsift::{
    map_to_output, Config, FileStore, HttpJobClient, Message, MessageBus, Reattachment,
    Reconciler, RecordStatus, VideoRecord,
};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = args.first() else {
        print_usage();
        return Ok(());
    };

    let config = Config::from_env();
    let client = Arc::new(HttpJobClient::new(config.server_url.clone()));
    let store = Arc::new(FileStore::open_default()?);
    let machine = Reconciler::new(
        client.clone(),
        store,
        MessageBus::new(),
        config.clone(),
    );

    match command.as_str() {
        "submit" => {
            let video_key = args.get(1).context("usage: clipsift submit <video-key> <url> <prompt>")?;
            let url = args.get(2).context("usage: clipsift submit <video-key> <url> <prompt>")?;
            let prompt = args[3..].join(" ");
            if prompt.is_empty() {
                bail!("usage: clipsift submit <video-key> <url> <prompt>");
            }

            let job_id = machine.submit(video_key, url, &prompt).await?;
            eprintln!("job {job_id} submitted, waiting for extraction...");
            let record = wait_for_outcome(&machine, video_key).await?;
            print_record(&record);
            exit_for(&record)
        }
        "status" => {
            let video_key = args.get(1).context("usage: clipsift status <video-key>")?;
            match machine.record(video_key)? {
                Some(record) => print_record(&record),
                None => println!("no record for {video_key}"),
            }
            Ok(())
        }
        "watch" => {
            let video_key = args.get(1).context("usage: clipsift watch <video-key>")?;
            match machine.reattach(video_key)? {
                Reattachment::Terminal(record) => {
                    print_record(&record);
                    exit_for(&record)
                }
                Reattachment::Polling(record) => {
                    eprintln!(
                        "job {} in flight, waiting...",
                        record.job_id.as_deref().unwrap_or("?")
                    );
                    let record = wait_for_outcome(&machine, video_key).await?;
                    print_record(&record);
                    exit_for(&record)
                }
                Reattachment::Adopted(record) => {
                    eprintln!(
                        "no record for {video_key}; adopted in-flight job for {}",
                        record.video_key
                    );
                    let key = record.video_key.clone();
                    let record = wait_for_outcome(&machine, &key).await?;
                    print_record(&record);
                    exit_for(&record)
                }
                Reattachment::Idle => {
                    println!("nothing in flight for {video_key}");
                    Ok(())
                }
            }
        }
        "clips" => {
            let video_key = args.get(1).context("usage: clipsift clips <video-key>")?;
            let record = machine
                .record(video_key)?
                .with_context(|| format!("no record for {video_key}"))?;
            let clips = record.clips.unwrap_or_default();
            if clips.is_empty() {
                println!("no clips");
                return Ok(());
            }

            let positions = map_to_output(&clips);
            println!(
                "{:>3}  {:>7}  {:>7}  {:>7}  {:>7}  text",
                "#", "src-in", "src-out", "out-in", "out-out"
            );
            for (index, (clip, position)) in clips.iter().zip(positions.iter()).enumerate() {
                println!(
                    "{:>3}  {:>6.1}s  {:>6.1}s  {:>6.1}s  {:>6.1}s  {}",
                    index + 1,
                    clip.start_time,
                    clip.end_time,
                    position.start,
                    position.end,
                    clip.text
                );
            }
            Ok(())
        }
        "start-over" => {
            let video_key = args.get(1).context("usage: clipsift start-over <video-key>")?;
            machine.start_over(video_key)?;
            println!("cleared {video_key}");
            Ok(())
        }
        "health" => {
            if client.health().await {
                println!("server is reachable at {}", config.server_url);
                Ok(())
            } else {
                bail!("cannot connect to server at {}", config.server_url);
            }
        }
        _ => {
            print_usage();
            Ok(())
        }
    }
}

/// Blocks until the reconciler publishes a terminal outcome for the key.
async fn wait_for_outcome(machine: &Reconciler, video_key: &str) -> Result<VideoRecord> {
    let mut rx = machine.bus().subscribe();
    loop {
        let message = match rx.recv().await {
            Ok(message) => message,
            Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed) => bail!("notification channel closed"),
        };
        match message {
            Message::ExtractionComplete { video_id, .. }
            | Message::ExtractionError { video_id, .. }
                if video_id == video_key =>
            {
                return machine
                    .record(video_key)?
                    .context("record vanished after the job finished");
            }
            _ => {}
        }
    }
}

fn print_record(record: &VideoRecord) {
    println!("video:   {}", record.video_key);
    println!("status:  {}", status_label(record.status));
    if let Some(job_id) = &record.job_id {
        println!("job:     {job_id}");
    }
    if let Some(error) = &record.error {
        println!("error:   {error}");
    }
    if let Some(output_url) = &record.output_url {
        println!("output:  {output_url}");
    }
    if let Some(clips) = &record.clips {
        println!("clips:   {}", clips.len());
    }
}

fn status_label(status: RecordStatus) -> &'static str {
    match status {
        RecordStatus::Pending => "pending",
        RecordStatus::Completed => "completed",
        RecordStatus::Failed => "failed",
    }
}

fn exit_for(record: &VideoRecord) -> Result<()> {
    if record.status == RecordStatus::Failed {
        bail!(
            "{}",
            record.error.as_deref().unwrap_or("extraction failed")
        );
    }
    Ok(())
}

fn print_usage() {
    eprintln!("usage: clipsift <command>");
    eprintln!();
    eprintln!("commands:");
    eprintln!("  submit <video-key> <url> <prompt>   submit a job and wait for the result");
    eprintln!("  status <video-key>                  print the persisted record");
    eprintln!("  watch <video-key>                   resume or render the persisted state");
    eprintln!("  clips <video-key>                   list clips with output positions");
    eprintln!("  start-over <video-key>              clear all persisted state for the key");
    eprintln!("  health                              check connectivity to the service");
}
