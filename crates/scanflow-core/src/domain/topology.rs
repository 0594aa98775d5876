//! Queue topology: durable work queues, their dead-letter bindings, archives.

use std::time::Duration;

use super::reward::PersistTarget;
use super::stage::Chain;

pub const DEAD_LETTER_EXCHANGE: &str = "dlx";

/// Background queues keep messages far longer than latency-sensitive stages.
pub const BACKGROUND_TTL: Duration = Duration::from_secs(24 * 60 * 60);

pub fn dead_letter_queue(queue: &str) -> String {
    format!("dlq.{queue}")
}

pub fn archive_queue(queue: &str) -> String {
    format!("archive.{queue}")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetterBinding {
    pub exchange: String,
    pub routing_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    pub name: String,
    pub durable: bool,
    pub dead_letter: Option<DeadLetterBinding>,
    pub message_ttl: Option<Duration>,
}

impl QueueSpec {
    /// Work queue bound to `dlx` with routing key `dlq.<name>`.
    pub fn work(name: impl Into<String>, ttl: Duration) -> Self {
        let name = name.into();
        Self {
            dead_letter: Some(DeadLetterBinding {
                exchange: DEAD_LETTER_EXCHANGE.to_string(),
                routing_key: dead_letter_queue(&name),
            }),
            name,
            durable: true,
            message_ttl: Some(ttl),
        }
    }

    /// Terminal holding queue (DLQ or archive): no TTL, no further dead-lettering.
    pub fn holding(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
            dead_letter: None,
            message_ttl: None,
        }
    }
}

/// One sweep target of the DLQ reprocessor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DlqRoute {
    pub dead_letter_queue: String,
    pub origin_queue: String,
    pub archive_queue: String,
}

impl DlqRoute {
    pub fn for_queue(origin: &str) -> Self {
        Self {
            dead_letter_queue: dead_letter_queue(origin),
            origin_queue: origin.to_string(),
            archive_queue: archive_queue(origin),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Topology {
    queues: Vec<QueueSpec>,
}

impl Topology {
    /// Stage queues plus the two persistence queues, each with its DLQ and archive.
    pub fn standard(chain: &Chain) -> Self {
        let mut work: Vec<QueueSpec> = chain
            .stages()
            .iter()
            .map(|stage| QueueSpec::work(stage.queue.clone(), stage.message_ttl))
            .collect();
        work.extend(
            PersistTarget::ALL
                .into_iter()
                .map(|target| QueueSpec::work(target.queue(), BACKGROUND_TTL)),
        );

        let mut queues = Vec::with_capacity(work.len() * 3);
        for spec in work {
            queues.push(QueueSpec::holding(dead_letter_queue(&spec.name)));
            queues.push(QueueSpec::holding(archive_queue(&spec.name)));
            queues.push(spec);
        }
        Self { queues }
    }

    pub fn queues(&self) -> &[QueueSpec] {
        &self.queues
    }

    pub fn get(&self, name: &str) -> Option<&QueueSpec> {
        self.queues.iter().find(|q| q.name == name)
    }

    /// One route per queue that dead-letters somewhere.
    pub fn dlq_routes(&self) -> Vec<DlqRoute> {
        self.queues
            .iter()
            .filter(|q| q.dead_letter.is_some())
            .map(|q| DlqRoute::for_queue(&q.name))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn work_queues_are_bound_to_dead_letter_exchange() {
        let topology = Topology::standard(&Chain::standard());
        let vision = topology.get("scan.vision").unwrap();

        assert!(vision.durable);
        let binding = vision.dead_letter.as_ref().unwrap();
        assert_eq!(binding.exchange, "dlx");
        assert_eq!(binding.routing_key, "dlq.scan.vision");
        assert!(topology.get("dlq.scan.vision").is_some());
        assert!(topology.get("archive.scan.vision").is_some());
    }

    #[test]
    fn background_queues_keep_messages_longer() {
        let topology = Topology::standard(&Chain::standard());
        let stage_ttl = topology.get("scan.rule").unwrap().message_ttl.unwrap();
        let persist_ttl = topology.get("reward.persist").unwrap().message_ttl.unwrap();
        assert!(persist_ttl > stage_ttl);
    }

    #[test]
    fn one_dlq_route_per_work_queue() {
        let routes = Topology::standard(&Chain::standard()).dlq_routes();
        assert_eq!(routes.len(), 6);
        assert!(routes.contains(&DlqRoute {
            dead_letter_queue: "dlq.my.sync".into(),
            origin_queue: "my.sync".into(),
            archive_queue: "archive.my.sync".into(),
        }));
    }
}
