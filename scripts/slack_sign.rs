// Print a signed curl request that mimics a Slack slash command
// Run: cargo run --bin slack_sign -- /getinfo my-instance [http://127.0.0.1:3000]

use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::time::{SystemTime, UNIX_EPOCH};

fn main() {
    dotenvy::dotenv().ok();

    let signing_secret = match std::env::var("SLACK_SIGNING_SECRET") {
        Ok(secret) => secret,
        Err(_) => {
            eprintln!("\n❌ SLACK_SIGNING_SECRET is not set in your .env file");
            eprintln!("   Copy it from your Slack app's Basic Information page.\n");
            std::process::exit(1);
        }
    };

    let mut args = std::env::args().skip(1);
    let command = args.next().unwrap_or_else(|| "/getinfo".to_string());
    let text = args.next().unwrap_or_default();
    let base_url = args
        .next()
        .unwrap_or_else(|| "http://127.0.0.1:3000".to_string());

    let body = serde_urlencoded::to_string([
        ("team_id", "T0LOCAL"),
        ("user_id", "U0LOCAL"),
        ("channel_id", "C0LOCAL"),
        ("command", command.as_str()),
        ("text", text.as_str()),
        (
            "response_url",
            "https://hooks.slack.com/commands/T0LOCAL/0/local",
        ),
    ])
    .expect("form encoding failed");

    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock before 1970")
        .as_secs()
        .to_string();

    let mut mac = Hmac::<Sha256>::new_from_slice(signing_secret.as_bytes())
        .expect("HMAC can take key of any size");
    mac.update(format!("v0:{}:{}", timestamp, body).as_bytes());
    let signature = format!("v0={}", hex::encode(mac.finalize().into_bytes()));

    println!("curl -sS -X POST '{}/slack/commands' \\", base_url);
    println!("  -H 'Content-Type: application/x-www-form-urlencoded' \\");
    println!("  -H 'X-Slack-Request-Timestamp: {}' \\", timestamp);
    println!("  -H 'X-Slack-Signature: {}' \\", signature);
    println!("  --data '{}'", body);
    eprintln!("\n(The signature is valid for 5 minutes.)");
}
