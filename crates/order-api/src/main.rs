//! # food-order
//!
//! Food ordering and checkout service.
//!
//! ## Usage
//!
//! ```bash
//! # Set environment variables
//! export STRIPE_SECRET_KEY=sk_test_...
//! export STRIPE_PUBLISHABLE_KEY=pk_test_...
//! export STRIPE_WEBHOOK_SECRET=whsec_...
//! export DATABASE_URL=sqlite://data/orders.db   # optional, in-memory otherwise
//!
//! # Run the server
//! food-order
//! ```

use order_api::{routes, state::AppState};
use order_stripe::REQUIRED_WEBHOOK_EVENTS;
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(Level::INFO.into())
                .from_env_lossy(),
        )
        .init();

    print_banner();

    let state = AppState::new().await?;

    let addr = state.config.socket_addr()?;
    let is_prod = state.config.is_production();

    info!("Environment: {}", state.config.environment);
    info!("Dishes on the menu: {}", state.menu.active_items().count());
    info!(
        "Order store: {}",
        if state.config.database_url.is_some() {
            "sqlite"
        } else {
            "memory"
        }
    );
    info!("Payment provider: {}", state.gateway.provider_name());

    let app = routes::create_router(state);

    info!("🍕 food-order starting on http://{}", addr);

    if !is_prod {
        info!("📝 Health: http://{}/health", addr);
        info!("💳 Checkout: POST http://{}/api/v1/checkout/payment-intent", addr);
        info!(
            "🔔 Webhook: POST http://{}/payments/webhook (events: {})",
            addr,
            REQUIRED_WEBHOOK_EVENTS.join(", ")
        );
    }

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

fn print_banner() {
    println!(
        r#"
  🍕 food-order 🍕
  ━━━━━━━━━━━━━━━━━━━━━━━
  Ordering & checkout service
  Version: {}

"#,
        env!("CARGO_PKG_VERSION")
    );
}
