use std::sync::Arc;

use async_trait::async_trait;
use keel_common::Result;
use serde_json::Value;

use crate::method::{Access, CallContext, Method};
use crate::metrics::MetricsCollector;

/// `_metrics` → [`MetricsSnapshot`](crate::metrics::MetricsSnapshot).
pub struct Metrics {
    collector: Arc<MetricsCollector>,
}

impl Metrics {
    pub fn new(collector: Arc<MetricsCollector>) -> Self {
        Self { collector }
    }
}

#[async_trait]
impl Method for Metrics {
    fn access(&self) -> Access {
        Access::Public
    }

    async fn execute(&self, _ctx: &CallContext, _args: Value) -> Result<Value> {
        Ok(serde_json::to_value(self.collector.snapshot())?)
    }
}

/// `_info` → [`WorkerInfo`](crate::metrics::WorkerInfo).
pub struct Info {
    collector: Arc<MetricsCollector>,
}

impl Info {
    pub fn new(collector: Arc<MetricsCollector>) -> Self {
        Self { collector }
    }
}

#[async_trait]
impl Method for Info {
    fn access(&self) -> Access {
        Access::Public
    }

    async fn execute(&self, _ctx: &CallContext, _args: Value) -> Result<Value> {
        Ok(serde_json::to_value(self.collector.info())?)
    }
}
