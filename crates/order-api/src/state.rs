//! # Application State
//!
//! Shared state for the Axum application.
//! Contains the menu, the order store, the payment gateway and the services
//! built on top of them.

use anyhow::Context;
use order_core::{
    BoxedPaymentGateway, CartService, CheckoutOrchestrator, CheckoutStore, MemoryStore, Menu,
    OrderLifecycle, RefundDesk, WebhookReconciler,
};
use order_store::SqliteStore;
use order_stripe::StripeGateway;
use std::sync::Arc;
use tracing::{info, warn};

/// Application configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Public base URL, used for confirmation redirects
    pub base_url: String,
    /// Environment (development, staging, production)
    pub environment: String,
    /// SQLite URL; orders are kept in memory when unset
    pub database_url: Option<String>,
    /// Menu file; the usual `config/menu.toml` locations are searched when unset
    pub menu_path: Option<String>,
}

impl AppConfig {
    /// Load from environment variables
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        Self {
            host: std::env::var("HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
            port: std::env::var("PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(8080),
            base_url: std::env::var("BASE_URL")
                .unwrap_or_else(|_| "http://localhost:8080".to_string()),
            environment: std::env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string()),
            database_url: std::env::var("DATABASE_URL").ok().filter(|v| !v.is_empty()),
            menu_path: std::env::var("MENU_PATH").ok().filter(|v| !v.is_empty()),
        }
    }

    /// Get the socket address to bind to
    pub fn socket_addr(&self) -> anyhow::Result<std::net::SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid socket address {}:{}", self.host, self.port))
    }

    /// Check if running in production
    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }

    /// Where the browser lands after a successful checkout
    pub fn confirmation_url(&self, purchase_order_id: &str) -> String {
        format!(
            "{}/orders/confirmed/{}",
            self.base_url.trim_end_matches('/'),
            purchase_order_id
        )
    }
}

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub menu: Arc<Menu>,
    pub store: Arc<dyn CheckoutStore>,
    pub gateway: BoxedPaymentGateway,
    pub carts: Arc<CartService>,
    pub checkout: Arc<CheckoutOrchestrator>,
    pub reconciler: Arc<WebhookReconciler>,
    pub lifecycle: Arc<OrderLifecycle>,
    pub refunds: Arc<RefundDesk>,
}

impl AppState {
    /// Build state from the environment with the Stripe gateway
    pub async fn new() -> anyhow::Result<Self> {
        let config = AppConfig::from_env();
        let menu = load_menu(config.menu_path.as_deref())?;

        let store: Arc<dyn CheckoutStore> = match &config.database_url {
            Some(url) => Arc::new(
                SqliteStore::connect(url)
                    .await
                    .with_context(|| format!("Failed to open order store at {}", url))?,
            ),
            None => {
                warn!("DATABASE_URL not set, orders are kept in memory only");
                Arc::new(MemoryStore::new())
            }
        };

        let gateway = StripeGateway::from_env()
            .map_err(|e| anyhow::anyhow!("Failed to initialize Stripe: {}", e))?;

        Ok(Self::from_parts(config, menu, store, Arc::new(gateway)))
    }

    /// Wire services around an explicit store and gateway
    pub fn from_parts(
        config: AppConfig,
        menu: Menu,
        store: Arc<dyn CheckoutStore>,
        gateway: BoxedPaymentGateway,
    ) -> Self {
        let menu = Arc::new(menu);

        Self {
            carts: Arc::new(CartService::new(store.clone(), menu.clone())),
            checkout: Arc::new(CheckoutOrchestrator::new(gateway.clone(), store.clone())),
            reconciler: Arc::new(WebhookReconciler::new(gateway.clone(), store.clone())),
            lifecycle: Arc::new(OrderLifecycle::new(store.clone())),
            refunds: Arc::new(RefundDesk::new(gateway.clone(), store.clone())),
            config,
            menu,
            store,
            gateway,
        }
    }
}

/// Load the menu from `path`, or from the first `config/menu.toml` found
fn load_menu(path: Option<&str>) -> anyhow::Result<Menu> {
    if let Some(path) = path {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read menu {}", path))?;
        return parse_menu(path, &content);
    }

    let config_paths = [
        "config/menu.toml",
        "../config/menu.toml",
        "../../config/menu.toml",
    ];

    for path in config_paths {
        if let Ok(content) = std::fs::read_to_string(path) {
            return parse_menu(path, &content);
        }
    }

    warn!("No menu found, starting with an empty menu");
    Ok(Menu::new())
}

fn parse_menu(path: &str, content: &str) -> anyhow::Result<Menu> {
    let menu =
        Menu::from_toml(content).map_err(|e| anyhow::anyhow!("Failed to parse {}: {}", path, e))?;
    info!("Loaded {} dishes from {}", menu.items.len(), path);
    Ok(menu)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> AppConfig {
        AppConfig {
            host: "0.0.0.0".to_string(),
            port: 3000,
            base_url: "http://localhost:3000/".to_string(),
            environment: "test".to_string(),
            database_url: None,
            menu_path: None,
        }
    }

    #[test]
    fn test_socket_addr() {
        let addr = config().socket_addr().unwrap();
        assert_eq!(addr.to_string(), "0.0.0.0:3000");

        let bad = AppConfig {
            host: "not a host".to_string(),
            ..config()
        };
        assert!(bad.socket_addr().is_err());
    }

    #[test]
    fn test_confirmation_url() {
        assert_eq!(
            config().confirmation_url("ORD1"),
            "http://localhost:3000/orders/confirmed/ORD1"
        );
    }

    #[test]
    fn test_bundled_menu_parses() {
        let content = include_str!("../../../config/menu.toml");
        let menu = parse_menu("config/menu.toml", content).unwrap();
        assert!(menu.active_items().count() > 0);
    }

    #[test]
    fn test_missing_explicit_menu_is_an_error() {
        assert!(load_menu(Some("/nonexistent/menu.toml")).is_err());
    }
}
