//! Mailroom Worker - Entry Point
//!
//! Background worker that drains the durable email queue through the
//! configured provider.

#[tokio::main]
async fn main() -> eyre::Result<()> {
    mailroom_worker::run().await
}
