use clap::Parser;
use serde_json::{Map, Value};
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

use verification_submitter::{
    SubmitError, VerificationData, VerificationSubmitter, config::Args, metrics,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // logs go to stderr, stdout carries the result
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(Level::INFO.into())
                .from_env_lossy(),
        )
        .init();

    // parse cli arguments
    let args = Args::parse();
    let config = args.submitter_config()?;

    info!(
        endpoint = %config.endpoint,
        max_attempts = config.policy.max_attempts,
        window_secs = args.window_secs,
        block_secs = args.block_secs,
        "Submitting verification"
    );

    let data = verification_data(&args)?;
    let submitter = VerificationSubmitter::builder(config).build()?;

    let outcome = submitter.submit(&data).await;

    if args.print_metrics {
        eprintln!("{}", metrics::render());
    }

    let result = outcome?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

// Merge --data JSON and --field pairs into the request body
fn verification_data(args: &Args) -> Result<VerificationData, SubmitError> {
    let mut fields = match &args.data {
        Some(raw) => match serde_json::from_str::<Value>(raw)? {
            Value::Object(map) => map,
            _ => return Err(SubmitError::Config("--data must be a JSON object".to_string())),
        },
        None => Map::new(),
    };

    for (key, value) in &args.fields {
        fields.insert(key.clone(), Value::String(value.clone()));
    }
    fields.remove("discordUserId");

    Ok(VerificationData {
        discord_user_id: args.user_id.clone(),
        fields,
    })
}
