// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Topology Management
//!
//! The harness routes everything through one exchange, one work queue and the
//! binding between them. [`provision`] declares all three on a short-lived session
//! before any worker starts. Declarations are idempotent on the broker side:
//! declaring the same entity twice with identical flags is a no-op, while a
//! declaration with different flags is rejected by the broker.
//!
//! The main components are:
//! - `Topology` trait: interface for registering and installing definitions
//! - `AmqpTopology`: implementation of the trait over a lapin channel
//! - `TopologyPlan`: the exchange, queue and binding the harness uses

use crate::{
    channel::open_session,
    config::TopologySettings,
    connection::{BrokerEndpoint, ConnectionBuilder, Connector},
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use lapin::{
    options::{ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions},
    types::FieldTable,
    Channel, Connection,
};
use tracing::{debug, error, info};

/// Trait defining the interface for topology management.
#[async_trait]
pub trait Topology<'tp> {
    /// Adds an exchange definition to the topology.
    fn exchange(self, def: &'tp ExchangeDefinition) -> Self;

    /// Adds a queue definition to the topology.
    fn queue(self, def: &'tp QueueDefinition) -> Self;

    /// Adds a queue-to-exchange binding to the topology.
    fn queue_binding(self, binding: &'tp QueueBinding) -> Self;

    /// Declares every registered exchange and queue, then every binding.
    async fn install(&self) -> Result<(), AmqpError>;
}

/// RabbitMQ implementation of the Topology trait.
pub struct AmqpTopology<'tp> {
    channel: &'tp Channel,
    pub(crate) queues: Vec<&'tp QueueDefinition>,
    pub(crate) queues_binding: Vec<&'tp QueueBinding>,
    pub(crate) exchanges: Vec<&'tp ExchangeDefinition>,
}

impl<'tp> AmqpTopology<'tp> {
    /// Creates a new AmqpTopology instance.
    ///
    /// # Parameters
    /// * `channel` - A channel to the RabbitMQ server
    pub fn new(channel: &'tp Channel) -> AmqpTopology<'tp> {
        AmqpTopology {
            channel,
            queues: vec![],
            queues_binding: vec![],
            exchanges: vec![],
        }
    }
}

#[async_trait]
impl<'tp> Topology<'tp> for AmqpTopology<'tp> {
    fn exchange(mut self, def: &'tp ExchangeDefinition) -> Self {
        self.exchanges.push(def);
        self
    }

    fn queue(mut self, def: &'tp QueueDefinition) -> Self {
        self.queues.push(def);
        self
    }

    fn queue_binding(mut self, binding: &'tp QueueBinding) -> Self {
        self.queues_binding.push(binding);
        self
    }

    /// Installs the topology to the RabbitMQ server.
    ///
    /// Exchanges first, then queues, then the bindings between them.
    async fn install(&self) -> Result<(), AmqpError> {
        self.install_exchange().await?;
        self.install_queue().await?;
        self.binding_queues().await
    }
}

impl AmqpTopology<'_> {
    async fn install_exchange(&self) -> Result<(), AmqpError> {
        for exch in &self.exchanges {
            debug!("creating exchange: {}", exch.name);

            match self
                .channel
                .exchange_declare(
                    &exch.name,
                    lapin::ExchangeKind::from(&exch.kind),
                    ExchangeDeclareOptions {
                        passive: false,
                        durable: exch.durable,
                        auto_delete: exch.delete,
                        internal: false,
                        nowait: false,
                    },
                    FieldTable::default(),
                )
                .await
            {
                Err(err) => {
                    error!(
                        error = err.to_string(),
                        name = exch.name.as_str(),
                        "error to declare the exchange"
                    );
                    Err(AmqpError::DeclareExchangeError(exch.name.clone()))
                }
                _ => Ok(()),
            }?;

            debug!("exchange: {} was created", exch.name);
        }

        Ok(())
    }

    async fn install_queue(&self) -> Result<(), AmqpError> {
        for def in &self.queues {
            debug!("creating queue: {}", def.name);

            match self
                .channel
                .queue_declare(
                    &def.name,
                    QueueDeclareOptions {
                        passive: false,
                        durable: def.durable,
                        exclusive: def.exclusive,
                        auto_delete: def.delete,
                        nowait: false,
                    },
                    FieldTable::default(),
                )
                .await
            {
                Err(err) => {
                    error!(
                        error = err.to_string(),
                        name = def.name.as_str(),
                        "error to declare the queue"
                    );
                    Err(AmqpError::DeclareQueueError(def.name.clone()))
                }
                Ok(queue) => {
                    debug!(
                        messages = queue.message_count(),
                        consumers = queue.consumer_count(),
                        "queue: {} was created",
                        def.name
                    );
                    Ok(())
                }
            }?;
        }

        Ok(())
    }

    async fn binding_queues(&self) -> Result<(), AmqpError> {
        for binding in &self.queues_binding {
            debug!(
                "binding queue: {} to the exchange: {} with the key: {}",
                binding.queue_name, binding.exchange_name, binding.routing_key
            );

            match self
                .channel
                .queue_bind(
                    &binding.queue_name,
                    &binding.exchange_name,
                    &binding.routing_key,
                    QueueBindOptions { nowait: false },
                    FieldTable::default(),
                )
                .await
            {
                Err(err) => {
                    error!(error = err.to_string(), "error to bind queue to exchange");

                    Err(AmqpError::BindingExchangeToQueueError(
                        binding.exchange_name.clone(),
                        binding.queue_name.clone(),
                    ))
                }
                _ => Ok(()),
            }?;
        }

        debug!("queue was bounded");

        Ok(())
    }
}

/// The exchange, queue and binding the workers rely on.
///
/// The exchange is intentionally not durable while the queue is: messages
/// already routed survive a broker restart, the routing entity is redeclared on
/// the next run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologyPlan {
    pub exchange: ExchangeDefinition,
    pub queue: QueueDefinition,
    pub binding: QueueBinding,
}

impl TopologyPlan {
    pub fn new(exchange: &str, queue: &str, routing_key: &str) -> Self {
        TopologyPlan {
            exchange: ExchangeDefinition::new(exchange),
            queue: QueueDefinition::new(queue).durable(),
            binding: QueueBinding::new(queue)
                .exchange(exchange)
                .routing_key(routing_key),
        }
    }

    pub fn exchange_name(&self) -> &str {
        self.exchange.name()
    }

    pub fn queue_name(&self) -> &str {
        self.queue.name()
    }

    pub fn routing_key(&self) -> &str {
        self.binding.key()
    }
}

impl Default for TopologyPlan {
    fn default() -> Self {
        TopologyPlan::from(&TopologySettings::default())
    }
}

impl From<&TopologySettings> for TopologyPlan {
    fn from(settings: &TopologySettings) -> Self {
        let mut plan = TopologyPlan::new(
            &settings.exchange,
            &settings.queue,
            &settings.routing_key,
        );
        plan.exchange = plan.exchange.kind(settings.exchange_kind.clone());
        plan
    }
}

/// Declares `plan` on a dedicated session that is closed whether or not the
/// declarations succeed.
pub async fn provision<C>(
    builder: &ConnectionBuilder<C>,
    endpoint: &BrokerEndpoint,
    plan: &TopologyPlan,
) -> Result<(), AmqpError>
where
    C: Connector<Connection = Connection>,
{
    let session = open_session(builder, endpoint).await?;

    let result = AmqpTopology::new(session.channel())
        .exchange(&plan.exchange)
        .queue(&plan.queue)
        .queue_binding(&plan.binding)
        .install()
        .await;

    session.close().await;

    if result.is_ok() {
        info!(
            exchange = plan.exchange_name(),
            queue = plan.queue_name(),
            routing_key = plan.routing_key(),
            "topology provisioned"
        );
    }

    result
}
