//! Resources: named groups of allocatable instances.
//!
//! A [`Resource`] owns its instance table inside one task. Updates arrive as
//! [`HealthEvent`]s; readers get snapshots through a watch channel.

mod adapter;
mod instance;
mod scatter;

use std::fmt;
use std::sync::Arc;

use error_stack::Report;
use futures::future::BoxFuture;
use futures::FutureExt;
use futures::Stream;
use mux::call;
use mux::AwaitDone;
use mux::Sink;
use mux::SinkError;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;
use tracing::debug;
use tracing::info;

pub use self::adapter::*;
pub use self::instance::*;
pub use self::scatter::ResourceRegistrar;
pub use self::scatter::Scatter;

#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("resource {0} is closed")]
    Closed(String),
}

/// Identity of a resource bucket; equal templates share one resource.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceTemplate {
    pub domain: String,
    pub prefix: String,
}

impl ResourceTemplate {
    pub fn new(domain: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            prefix: prefix.into(),
        }
    }

    /// Extended resource name, `<domain>/<prefix>`.
    pub fn name(&self) -> String {
        format!("{}/{}", self.domain, self.prefix)
    }
}

impl fmt::Display for ResourceTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.domain, self.prefix)
    }
}

/// Verdict for a batch of instances, merged into a resource's table.
#[derive(Debug, Clone)]
pub struct HealthEvent {
    pub instances: Vec<SharedInstance>,
    pub health: Health,
}

enum Command {
    Update(HealthEvent),
    Close(AwaitDone<()>),
}

/// Handle to one resource's authority task.
#[derive(Clone)]
pub struct Resource {
    name: Arc<str>,
    template: ResourceTemplate,
    commands: mpsc::Sender<Command>,
    table: watch::Receiver<Arc<InstanceTable>>,
}

impl fmt::Debug for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resource")
            .field("name", &self.name)
            .field("instances", &self.table.borrow().len())
            .finish()
    }
}

impl Resource {
    /// Spawns the authority task with a table seeded from `instances`, all
    /// with a healthy verdict.
    pub fn spawn(template: ResourceTemplate, instances: Vec<SharedInstance>) -> Self {
        let name: Arc<str> = template.name().into();
        let mut table = InstanceTable::new();
        upsert(&mut table, instances, Health::Healthy);

        let (snapshot, rx) = watch::channel(Arc::new(table.clone()));
        let (commands, commands_rx) = mpsc::channel(32);
        let authority = Authority {
            name: Arc::clone(&name),
            table,
            snapshot,
        };
        tokio::spawn(authority.run(commands_rx));

        Self {
            name,
            template,
            commands,
            table: rx,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn template(&self) -> &ResourceTemplate {
        &self.template
    }

    /// Point-in-time snapshot of the instance table.
    pub fn instances(&self) -> Arc<InstanceTable> {
        Arc::clone(&self.table.borrow())
    }

    /// Queues `event` for the authority task.
    ///
    /// # Errors
    ///
    /// - [`ResourceError::Closed`] once the resource has been closed
    pub async fn submit(&self, event: HealthEvent) -> Result<(), Report<ResourceError>> {
        self.commands
            .send(Command::Update(event))
            .await
            .map_err(|_| Report::new(ResourceError::Closed(self.name.to_string())))
    }

    /// Stream of full tables: the current one first, then one per applied
    /// update. Ends when the resource closes.
    pub fn list_and_watch(&self) -> impl Stream<Item = Arc<InstanceTable>> + Send + 'static {
        WatchStream::new(self.table.clone())
    }

    /// Applies every queued update, then stops the authority task.
    pub async fn close(&self) {
        if call(&self.commands, (), Command::Close).await.is_err() {
            debug!(resource = %self.name, "resource already closed");
        }
    }
}

impl Sink<HealthEvent> for Resource {
    fn submit(&mut self, value: HealthEvent) -> BoxFuture<'_, Result<(), SinkError>> {
        async move {
            self.commands
                .send(Command::Update(value))
                .await
                .map_err(|_| SinkError::Closed)
        }
        .boxed()
    }
}

fn upsert(table: &mut InstanceTable, instances: Vec<SharedInstance>, health: Health) {
    for instance in instances {
        table.insert(instance.id(), TrackedInstance::new(instance, health));
    }
}

struct Authority {
    name: Arc<str>,
    table: InstanceTable,
    snapshot: watch::Sender<Arc<InstanceTable>>,
}

impl Authority {
    #[tracing::instrument(skip_all, fields(resource = %self.name))]
    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        let mut closing = Vec::new();
        while let Some(command) = commands.recv().await {
            match command {
                Command::Update(event) => self.apply(event),
                Command::Close(request) => {
                    // refuse new commands but drain what is already queued
                    commands.close();
                    closing.push(request);
                }
            }
        }
        info!("resource closed");
        for request in closing {
            request.done();
        }
    }

    fn apply(&mut self, event: HealthEvent) {
        debug!(
            "applying {} verdict to {} instances",
            event.health,
            event.instances.len()
        );
        upsert(&mut self.table, event.instances, event.health);
        self.snapshot.send_replace(Arc::new(self.table.clone()));
    }
}


#[cfg(test)]
mod tests {
    use futures::StreamExt;
    use similar_asserts::assert_eq;
    use test_log::test;

    use super::testing::*;
    use super::*;

    fn template() -> ResourceTemplate {
        ResourceTemplate::new("ydb.tech", "part-01")
    }

    #[test]
    fn template_name() {
        assert_eq!(template().name(), "ydb.tech/part-01");
        assert_eq!(template().to_string(), "ydb.tech/part-01");
    }

    #[test(tokio::test)]
    async fn table_is_upsert_fold_of_events() {
        let resource = Resource::spawn(template(), vec![instance("a"), instance("b")]);

        resource
            .submit(HealthEvent {
                instances: vec![instance("b"), instance("c")],
                health: Health::Unhealthy,
            })
            .await
            .expect("submit");
        resource
            .submit(HealthEvent {
                instances: vec![instance("c")],
                health: Health::Healthy,
            })
            .await
            .expect("submit");
        resource.close().await;

        assert_eq!(
            health_of(&resource.instances()),
            vec![
                ("a".to_string(), Health::Healthy),
                ("b".to_string(), Health::Unhealthy),
                ("c".to_string(), Health::Healthy),
            ]
        );
    }

    #[test(tokio::test)]
    async fn list_and_watch_yields_full_tables() {
        let resource = Resource::spawn(template(), vec![instance("a")]);
        let mut stream = Box::pin(resource.list_and_watch());

        let first = stream.next().await.expect("initial table");
        assert_eq!(health_of(&first), vec![("a".to_string(), Health::Healthy)]);

        resource
            .submit(HealthEvent {
                instances: vec![instance("a")],
                health: Health::Unhealthy,
            })
            .await
            .expect("submit");
        let second = stream.next().await.expect("updated table");
        assert_eq!(health_of(&second), vec![("a".to_string(), Health::Unhealthy)]);

        resource.close().await;
        assert!(stream.next().await.is_none(), "stream should end on close");
    }

    #[test(tokio::test)]
    async fn submit_after_close_fails() {
        let resource = Resource::spawn(template(), vec![]);
        resource.close().await;
        resource.close().await;

        let result = resource
            .submit(HealthEvent {
                instances: vec![instance("a")],
                health: Health::Healthy,
            })
            .await;
        assert!(result.is_err());
    }
}
