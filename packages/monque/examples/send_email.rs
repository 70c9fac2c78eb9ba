//! Minimal producer/worker setup against a real Postgres.
//!
//! ```sh
//! DATABASE_URL=postgres://localhost/monque cargo run --example send_email
//! ```

use monque::{Job, JobEvent, Monque, MonqueConfig};
use serde_json::json;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "monque=debug,info".into()),
        )
        .init();

    let database_url = std::env::var("DATABASE_URL")?;
    let pool = sqlx::PgPool::connect(&database_url).await?;

    let monque = Monque::new(pool, MonqueConfig::default())?;

    monque.register("send-email", |job: Job| async move {
        println!("sending email to {}", job.data["to"]);
        Ok(())
    })?;

    // Log every lifecycle event.
    let mut events = monque.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                JobEvent::Completed { job, duration_ms } => {
                    println!("{} finished in {duration_ms} ms", job.name);
                }
                JobEvent::Failed { job, error, will_retry } => {
                    println!("{} failed ({error}), retry: {will_retry}", job.name);
                }
                _ => {}
            }
        }
    });

    monque.init().await?;
    monque
        .now("send-email", json!({"to": "someone@example.com"}))
        .await?;
    monque
        .schedule("0 9 * * *", "send-email", json!({"to": "digest@example.com"}), Default::default())
        .await?;

    monque.run_until_shutdown().await?;
    Ok(())
}
