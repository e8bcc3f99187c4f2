//! Runs a small order workflow on the in-memory transport and prints the
//! resulting pipe probe and delivery outcomes.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use courier_bus::{
    Bus, BusConfig, CircuitBreakerConfig, CompositeSink, ConsumeContext, ConsumerRegistration,
    InMemoryTransport, MemorySink, MetricsSink, ObservabilitySink, RetryPolicy, TracingSink,
};
use courier_core::{Error, Errors, Message, MessageTypeName};
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "courier-demo", about = "Exercise the courier bus in memory")]
struct Options {
    /// Number of orders to submit.
    #[arg(long, env = "COURIER_DEMO_ORDERS", default_value_t = 10)]
    orders: u32,

    /// Every n-th order is rejected by its consumer (0 disables).
    #[arg(long, env = "COURIER_DEMO_REJECT_EVERY", default_value_t = 4)]
    reject_every: u32,

    /// Immediate retries before a rejected order is dead-lettered.
    #[arg(long, env = "COURIER_DEMO_RETRIES", default_value_t = 2)]
    retries: u32,

    /// Concurrent deliveries per endpoint.
    #[arg(long, env = "COURIER_DEMO_CONCURRENCY", default_value_t = 4)]
    concurrency: u32,

    /// Seconds to wait for every delivery to finish.
    #[arg(long, env = "COURIER_DEMO_WAIT_SECS", default_value_t = 10)]
    wait_secs: u64,

    #[arg(long, env = "COURIER_LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Keep consuming until Ctrl-C after the workflow finishes.
    #[arg(long)]
    serve: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SubmitOrder {
    number: u32,
    sku: String,
}

impl Message for SubmitOrder {
    fn message_type() -> MessageTypeName {
        MessageTypeName::new("Demo.Orders", "SubmitOrder")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OrderAccepted {
    number: u32,
}

impl Message for OrderAccepted {
    fn message_type() -> MessageTypeName {
        MessageTypeName::new("Demo.Orders", "OrderAccepted")
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn submit_consumer(reject_every: u32) -> ConsumerRegistration {
    ConsumerRegistration::handler("SubmitOrderConsumer", move |ctx: ConsumeContext<SubmitOrder>| async move {
        let order = ctx.message();
        ctx.add_field("sku", order.sku.clone());
        if reject_every > 0 && order.number % reject_every == 0 {
            return Err(Errors::from(Error::validation(
                "out_of_stock",
                format!("sku {} is out of stock", order.sku),
            )));
        }
        ctx.publish(&OrderAccepted { number: order.number }).await
    })
}

fn accepted_consumer() -> ConsumerRegistration {
    ConsumerRegistration::handler("NotifyCustomer", |ctx: ConsumeContext<OrderAccepted>| async move {
        tracing::info!(order = ctx.message().number, "customer notified");
        Ok::<(), Errors>(())
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let options = Options::parse();
    init_tracing(options.log_format);

    let memory = Arc::new(MemorySink::new());
    let sink: Arc<dyn ObservabilitySink> = Arc::new(
        CompositeSink::new()
            .with(TracingSink)
            .with(MetricsSink::default())
            .with_shared(memory.clone()),
    );
    let transport = InMemoryTransport::new();

    let mut config = BusConfig {
        name: "courier-demo".to_string(),
        ..BusConfig::default()
    };
    config.endpoint_defaults.concurrency_limit = options.concurrency;

    let retries = options.retries;
    let reject_every = options.reject_every;
    let bus = Bus::builder()
        .config(config)
        .transport(transport.clone())
        .sink(sink)
        .receive_endpoint("orders", move |e| {
            e.retry(RetryPolicy::immediate(retries))
                .circuit_breaker(CircuitBreakerConfig::default())
                .consumer(submit_consumer(reject_every))
        })
        .receive_endpoint("notifications", |e| e.consumer(accepted_consumer()))
        .map_endpoint::<SubmitOrder>("orders")
        .build()
        .context("invalid bus configuration")?;

    println!("{}", serde_json::to_string_pretty(&bus.probe())?);
    bus.start().await.context("failed to start bus")?;

    for number in 1..=options.orders {
        let order = SubmitOrder {
            number,
            sku: format!("sku-{}", number % 3),
        };
        bus.send(&order).await.context("failed to send order")?;
    }

    let rejected = if options.reject_every == 0 {
        0
    } else {
        options.orders / options.reject_every
    };
    let expected = usize::try_from(options.orders * 2 - rejected)?;
    if !memory.wait_for(expected, Duration::from_secs(options.wait_secs)).await {
        tracing::warn!(expected, recorded = memory.len(), "not every delivery finished in time");
    }

    if options.serve {
        tracing::info!("consuming until Ctrl-C");
        tokio::signal::ctrl_c().await.context("failed to wait for Ctrl-C")?;
    }
    bus.stop().await.context("failed to stop bus")?;

    let mut summary: BTreeMap<&str, usize> = BTreeMap::new();
    for outcome in memory.outcomes() {
        *summary.entry(outcome.kind.as_str()).or_default() += 1;
    }
    println!("{}", serde_json::to_string_pretty(&summary)?);
    println!("dead-lettered: {}", transport.drain("orders_error").len());
    Ok(())
}
