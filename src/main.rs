//! OpenSASE Checkout - order, payment and stock service

use anyhow::Result;
use opensase_checkout::{
    api::{router, AppState},
    domain::aggregates::PaymentMethod,
    infrastructure::{LogNotifier, NatsNotifier, PgOrderStore, SimulatedGateway},
    ports::{NotificationPort, OrderStore, PaymentGateways},
    AppConfig, OrderStateMachine,
};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry().with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into())).with(tracing_subscriber::fmt::layer()).init();
    let config = AppConfig::from_env()?;

    let db = PgPoolOptions::new().max_connections(10).connect(&config.database_url).await?;
    sqlx::migrate!("./migrations").run(&db).await?;
    let store = PgOrderStore::new(db);
    let tariffs = store.load_tariffs().await?;
    if tariffs.is_empty() {
        tracing::warn!("No shipping tariffs loaded, carrier quotes will fail");
    }

    // Credentials without the sandbox opt-in were already refused by the config.
    let mut gateways = PaymentGateways::new();
    if config.simulated_payments {
        for (method, credentials) in [(PaymentMethod::Stripe, &config.stripe), (PaymentMethod::Paypal, &config.paypal)] {
            if let Some(credentials) = credentials {
                tracing::warn!(%method, "Using the simulated payment gateway, no money will move");
                gateways = gateways.with(Arc::new(SimulatedGateway::new(method, credentials.clone())));
            }
        }
    }
    tracing::info!(methods = ?gateways.methods().collect::<Vec<_>>(), "Payment gateways ready");

    let notifier: Arc<dyn NotificationPort> = match &config.nats_url {
        Some(url) => match async_nats::connect(url.as_str()).await {
            Ok(client) => Arc::new(NatsNotifier::new(client, "checkout.notifications")),
            Err(e) => {
                tracing::warn!(error = %e, "NATS unreachable, notifications go to the log");
                Arc::new(LogNotifier)
            }
        },
        None => Arc::new(LogNotifier),
    };

    let machine = OrderStateMachine::new(Arc::new(store), gateways, notifier, tariffs)
        .with_vat(config.vat_rate)
        .with_currency(&config.currency)
        .with_timeouts(config.gateway_timeout, config.notification_timeout);

    let app = router(AppState { machine: Arc::new(machine) })
        .layer(TraceLayer::new_for_http()).layer(CorsLayer::permissive());

    tracing::info!("🚀 OpenSASE Checkout listening on 0.0.0.0:{}", config.port);
    axum::serve(tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.port)).await?, app).await?;
    Ok(())
}
