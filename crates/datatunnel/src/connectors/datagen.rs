//! Datagen source connector
//!
//! Generates synthetic rows without any external system. Useful for demos,
//! benchmarks and exercising sinks.
//!
//! # Patterns
//!
//! - `sequence`: `{"id": n}` for n = 0, 1, 2, ...
//! - `users`: fake user records with names, emails and countries
//! - `orders`: fake e-commerce orders
//!
//! ```text
//! DATATUNNEL SOURCE("datagen") OPTIONS(rowCount=1000, pattern="users", seed=42)
//! SINK("log") OPTIONS(numRows=5)
//! ```

use crate::error::{ConnectorResult, OptionsError};
use crate::options::{OptionSchema, OptionType, OptionsBag, Projection};
use crate::traits::{Batch, BatchStream, Source, SourceFactory};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::debug;
use validator::Validate;

/// Data generation patterns
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataPattern {
    #[default]
    Sequence,
    Users,
    Orders,
}

impl DataPattern {
    const CHOICES: &'static [&'static str] = &["sequence", "users", "orders"];
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct DatagenConfig {
    #[validate(range(max = 1_000_000_000))]
    pub row_count: u64,

    #[validate(range(min = 1, max = 1_000_000))]
    pub batch_size: usize,

    pub pattern: DataPattern,

    /// Seed for reproducible output; time-based when absent
    #[serde(default)]
    pub seed: Option<u64>,
}

/// Xorshift generator; deterministic for a given seed
struct Rng {
    state: u64,
}

impl Rng {
    fn new(seed: u64) -> Self {
        Self {
            state: if seed == 0 { 0x853c49e6748fea9b } else { seed },
        }
    }

    fn from_time() -> Self {
        let seed = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0x853c49e6748fea9b);
        Self::new(seed)
    }

    fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.state = x;
        x
    }

    fn range(&mut self, min: u64, max: u64) -> u64 {
        if min >= max {
            return min;
        }
        min + (self.next_u64() % (max - min))
    }

    fn choose<'a, T>(&mut self, items: &'a [T]) -> &'a T {
        let idx = self.range(0, items.len() as u64) as usize;
        &items[idx]
    }
}

const FIRST_NAMES: &[&str] = &[
    "Alice", "Bob", "Carol", "David", "Eve", "Frank", "Grace", "Henry", "Ivy", "Jack", "Kate",
    "Leo", "Mia", "Noah", "Olivia", "Peter",
];
const LAST_NAMES: &[&str] = &[
    "Smith", "Johnson", "Williams", "Brown", "Jones", "Garcia", "Miller", "Davis", "Martinez",
    "Anderson", "Taylor", "Thomas", "Moore", "White",
];
const DOMAINS: &[&str] = &["example.com", "test.org", "demo.net", "mail.io", "acme.co"];
const COUNTRIES: &[&str] = &["US", "UK", "DE", "FR", "JP", "AU", "CA", "BR", "IN", "MX"];
const PRODUCTS: &[&str] = &["widget", "gadget", "gizmo", "doohickey", "sprocket"];
const STATUSES: &[&str] = &["pending", "paid", "shipped", "delivered", "cancelled"];

struct Generator {
    rng: Rng,
    pattern: DataPattern,
    next: u64,
    remaining: u64,
}

impl Generator {
    fn record(&mut self) -> Map<String, Value> {
        let seq = self.next;
        self.next += 1;
        let value = match self.pattern {
            DataPattern::Sequence => json!({ "id": seq }),
            DataPattern::Users => {
                let first = *self.rng.choose(FIRST_NAMES);
                let last = *self.rng.choose(LAST_NAMES);
                let domain = *self.rng.choose(DOMAINS);
                json!({
                    "id": seq,
                    "first_name": first,
                    "last_name": last,
                    "email": format!("{}.{}@{}", first.to_lowercase(), last.to_lowercase(), domain),
                    "age": self.rng.range(18, 80),
                    "country": *self.rng.choose(COUNTRIES),
                })
            }
            DataPattern::Orders => {
                let quantity = self.rng.range(1, 10);
                let unit_cents = self.rng.range(199, 19_999);
                json!({
                    "order_id": format!("order_{:08}", seq),
                    "customer_id": self.rng.range(1, 10_000),
                    "product": *self.rng.choose(PRODUCTS),
                    "quantity": quantity,
                    "total": (quantity * unit_cents) as f64 / 100.0,
                    "status": *self.rng.choose(STATUSES),
                })
            }
        };
        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    fn next_batch(&mut self, size: usize) -> Option<Batch> {
        if self.remaining == 0 {
            return None;
        }
        let n = self.remaining.min(size as u64);
        self.remaining -= n;
        Some(Batch::from_records((0..n).map(|_| self.record()).collect()))
    }
}

pub struct DatagenSource {
    config: DatagenConfig,
    projection: Projection,
}

#[async_trait]
impl Source for DatagenSource {
    fn kind(&self) -> &str {
        "datagen"
    }

    async fn open(&mut self) -> ConnectorResult<()> {
        debug!(
            rows = self.config.row_count,
            pattern = ?self.config.pattern,
            "Opened datagen source"
        );
        Ok(())
    }

    async fn read(&mut self) -> ConnectorResult<BatchStream> {
        let generator = Generator {
            rng: self.config.seed.map(Rng::new).unwrap_or_else(Rng::from_time),
            pattern: self.config.pattern,
            next: 0,
            remaining: self.config.row_count,
        };
        let batch_size = self.config.batch_size;
        let projection = self.projection.clone();
        let batches = stream::unfold(generator, move |mut generator| {
            let projection = projection.clone();
            async move {
                let batch = generator.next_batch(batch_size)?;
                Some((batch.project(&projection), generator))
            }
        });
        Ok(batches.boxed())
    }

    async fn close(&mut self) -> ConnectorResult<()> {
        Ok(())
    }
}

pub struct DatagenSourceFactory;

impl SourceFactory for DatagenSourceFactory {
    fn schema(&self) -> OptionSchema {
        OptionSchema::new("datagen")
            .required("rowCount", OptionType::Integer, "Total rows to generate")
            .with_default("batchSize", OptionType::Integer, 100, "Rows per batch")
            .with_default(
                "pattern",
                OptionType::OneOf(DataPattern::CHOICES),
                "sequence",
                "Shape of generated rows",
            )
            .optional("seed", OptionType::Integer, "Random seed for reproducible rows")
            .with_columns()
    }

    fn create(&self, options: OptionsBag) -> Result<Box<dyn Source>, OptionsError> {
        let config: DatagenConfig = options.deserialize()?;
        Ok(Box::new(DatagenSource {
            projection: options.projection()?,
            config,
        }))
    }
}
