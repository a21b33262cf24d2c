use std::collections::HashMap;
use std::sync::Arc;

use snowcast_core::{HandlerSpec, SchedulerError, SchedulerResult, TaskCatalog, TaskHandler};
use tracing::info;

/// 已注册的处理器及其注解
#[derive(Clone)]
pub struct RegisteredHandler {
    pub handler: Arc<dyn TaskHandler>,
    pub spec: HandlerSpec,
}

/// 启动时构建的处理器注册表，之后只读
///
/// 目录中的每个条目必须恰好有一个处理器实现，反之亦然。
pub struct HandlerRegistry {
    catalog: Arc<TaskCatalog>,
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new(
        catalog: Arc<TaskCatalog>,
        handlers: impl IntoIterator<Item = Arc<dyn TaskHandler>>,
    ) -> SchedulerResult<Self> {
        let mut registered: HashMap<String, Arc<dyn TaskHandler>> = HashMap::new();
        for handler in handlers {
            let name = handler.name().to_string();
            if !catalog.contains(&name) {
                return Err(SchedulerError::Configuration(format!(
                    "处理器 {name} 不在任务目录中"
                )));
            }
            if registered.insert(name.clone(), handler).is_some() {
                return Err(SchedulerError::Configuration(format!(
                    "处理器 {name} 重复注册"
                )));
            }
            info!("Registered task handler: {}", name);
        }

        let missing: Vec<&str> = catalog
            .specs()
            .map(|spec| spec.name.as_str())
            .filter(|name| !registered.contains_key(*name))
            .collect();
        if !missing.is_empty() {
            return Err(SchedulerError::Configuration(format!(
                "任务目录中的处理器没有实现: {}",
                missing.join(", ")
            )));
        }

        Ok(Self {
            catalog,
            handlers: registered,
        })
    }

    pub fn get(&self, handler_name: &str) -> SchedulerResult<RegisteredHandler> {
        let spec = self.catalog.spec(handler_name)?;
        let handler = self
            .handlers
            .get(handler_name)
            .cloned()
            .ok_or_else(|| SchedulerError::HandlerNotFound {
                name: handler_name.to_string(),
            })?;
        Ok(RegisteredHandler {
            handler,
            spec: spec.clone(),
        })
    }

    pub fn catalog(&self) -> &Arc<TaskCatalog> {
        &self.catalog
    }

    /// 有处理器的全部队列
    pub fn queues(&self) -> Vec<String> {
        self.catalog.queues()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use snowcast_core::config::HandlersConfig;
    use snowcast_core::models::HandlerOutcome;
    use snowcast_core::{TaskContext, HANDLER_CLEANUP, HANDLER_FETCH_OBSERVATIONS};

    struct Named(&'static str);

    #[async_trait]
    impl TaskHandler for Named {
        fn name(&self) -> &str {
            self.0
        }

        async fn handle(&self, _ctx: TaskContext) -> HandlerOutcome {
            HandlerOutcome::Success(serde_json::Value::Null)
        }
    }

    fn catalog() -> Arc<TaskCatalog> {
        Arc::new(
            TaskCatalog::new(
                [HANDLER_FETCH_OBSERVATIONS, HANDLER_CLEANUP],
                &HandlersConfig::default(),
            )
            .unwrap(),
        )
    }

    #[test]
    fn test_registry_pairs_catalog_with_handlers() {
        let registry = HandlerRegistry::new(
            catalog(),
            [
                Arc::new(Named(HANDLER_FETCH_OBSERVATIONS)) as Arc<dyn TaskHandler>,
                Arc::new(Named(HANDLER_CLEANUP)),
            ],
        )
        .unwrap();
        assert_eq!(registry.len(), 2);

        let fetch = registry.get(HANDLER_FETCH_OBSERVATIONS).unwrap();
        assert_eq!(fetch.spec.queue, "data_fetch");
        assert_eq!(fetch.spec.rate_limit_per_minute, 10);
        assert!(matches!(
            registry.get("simulation.run_batch"),
            Err(SchedulerError::HandlerNotFound { .. })
        ));
    }

    #[test]
    fn test_registry_rejects_mismatches() {
        let missing = HandlerRegistry::new(
            catalog(),
            [Arc::new(Named(HANDLER_FETCH_OBSERVATIONS)) as Arc<dyn TaskHandler>],
        );
        assert!(matches!(missing, Err(SchedulerError::Configuration(_))));

        let unknown = HandlerRegistry::new(
            catalog(),
            [
                Arc::new(Named(HANDLER_FETCH_OBSERVATIONS)) as Arc<dyn TaskHandler>,
                Arc::new(Named(HANDLER_CLEANUP)),
                Arc::new(Named("fetch.unknown")),
            ],
        );
        assert!(matches!(unknown, Err(SchedulerError::Configuration(_))));

        let duplicate = HandlerRegistry::new(
            catalog(),
            [
                Arc::new(Named(HANDLER_FETCH_OBSERVATIONS)) as Arc<dyn TaskHandler>,
                Arc::new(Named(HANDLER_FETCH_OBSERVATIONS)),
                Arc::new(Named(HANDLER_CLEANUP)),
            ],
        );
        assert!(duplicate.is_err());
    }
}
