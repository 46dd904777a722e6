use anyhow::{Result, bail};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tokio::task::JoinSet;
use uuid::Uuid;

/// Fires concurrent upvotes at a running server and checks that every distinct voter was
/// counted exactly once.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    #[arg(long, default_value = "http://localhost:1111")]
    base_url: String,

    /// Distinct voters
    #[arg(long, default_value_t = 100)]
    voters: u64,

    /// Upvotes sent per voter
    #[arg(long, default_value_t = 3)]
    repeats: u64,
}

#[derive(Deserialize)]
struct Feature {
    id: Uuid,
    votes: u64,
}

#[derive(Deserialize)]
struct Vote {
    outcome: String,
}

/// Clones of the returned bar share one position, so each task gets its own clone.
fn progress_bar(total: u64) -> Result<ProgressBar> {
    let pb = ProgressBar::new(total);
    pb.set_style(
        ProgressStyle::with_template(
            "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}",
        )?
        .progress_chars("=> "),
    );

    Ok(pb)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let client = Client::new();

    let feature: Feature = client
        .post(format!("{}/features", args.base_url))
        .json(&json!({ "title": format!("Load test {}", Uuid::new_v4()) }))
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;

    println!("Created feature {}", feature.id);

    let total = args.voters * args.repeats;
    let pb = progress_bar(total)?;

    let upvote_url = format!("{}/features/{}/upvote", args.base_url, feature.id);
    let mut tasks = JoinSet::new();

    for attempt in 0..total {
        let client = client.clone();
        let url = upvote_url.clone();
        let pb = pb.clone();
        let voter = format!("tester-{}", attempt % args.voters);

        tasks.spawn(async move {
            let vote: Vote = client
                .post(url)
                .header("x-voter-key", voter)
                .send()
                .await?
                .error_for_status()?
                .json()
                .await?;
            pb.inc(1);

            Ok::<_, reqwest::Error>(vote.outcome == "applied")
        });
    }

    let mut applied = 0;
    while let Some(result) = tasks.join_next().await {
        if result?? {
            applied += 1;
        }
    }

    pb.finish_with_message("Done");

    let feature: Feature = client
        .get(format!("{}/features/{}", args.base_url, feature.id))
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;

    println!("\nUpvotes sent: {total}");
    println!("Applied: {applied}");
    println!("Final tally: {}", feature.votes);

    if applied != args.voters || feature.votes != args.voters {
        bail!(
            "expected {} votes, {} applied and tally is {}",
            args.voters,
            applied,
            feature.votes
        );
    }

    println!("Tally consistent");

    Ok(())
}
