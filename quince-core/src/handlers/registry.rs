use std::time::Duration;
use std::time::Instant;

use enum_map::Enum;
use enum_map::EnumMap;
use itertools::Itertools;

use super::default_handler::DefaultHandler;
use super::handler::HandlerId;
use super::handler::NonlinearHandler;
use crate::containers::KeyedVec;
use crate::containers::StorageKey;
use crate::statistics::Statistic;
use crate::statistics::StatisticLogger;

/// The handler callbacks that are timed and counted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Enum)]
pub enum HandlerCallback {
    Detect,
    EvalAux,
    IntervalEvaluate,
    ReversePropagate,
    Estimate,
    Enforce,
    InitSeparation,
    ExitSeparation,
}

impl HandlerCallback {
    fn name(self) -> &'static str {
        match self {
            HandlerCallback::Detect => "detect",
            HandlerCallback::EvalAux => "eval_aux",
            HandlerCallback::IntervalEvaluate => "interval_evaluate",
            HandlerCallback::ReversePropagate => "reverse_propagate",
            HandlerCallback::Estimate => "estimate",
            HandlerCallback::Enforce => "enforce",
            HandlerCallback::InitSeparation => "init_separation",
            HandlerCallback::ExitSeparation => "exit_separation",
        }
    }
}

/// Per-handler call counts and cumulative wall time per callback.
#[derive(Debug, Default, Clone)]
pub struct HandlerStatistics {
    calls: EnumMap<HandlerCallback, u64>,
    time: EnumMap<HandlerCallback, Duration>,
}

impl HandlerStatistics {
    pub fn num_calls(&self, callback: HandlerCallback) -> u64 {
        self.calls[callback]
    }

    pub fn time_spent(&self, callback: HandlerCallback) -> Duration {
        self.time[callback]
    }
}

impl Statistic for HandlerStatistics {
    fn log(&self, statistic_logger: StatisticLogger) {
        for (callback, count) in &self.calls {
            if *count == 0 {
                continue;
            }
            count.log(
                statistic_logger.attach_to_prefix(format!("num_{}_calls", callback.name())),
            );
            self.time[callback].as_micros().log(
                statistic_logger.attach_to_prefix(format!("{}_time_micros", callback.name())),
            );
        }
    }
}

/// The registry of nonlinear handlers, ordered by descending detection priority (ties broken by
/// name so detection is deterministic).
///
/// The registry is immutable after setup: handlers are registered before the first detection
/// pass and only read afterwards. The built-in [`DefaultHandler`] is always present at the
/// lowest priority as the engine's totality guarantee.
#[derive(Debug)]
pub struct HandlerRegistry {
    handlers: Vec<Box<dyn NonlinearHandler>>,
    statistics: KeyedVec<HandlerId, HandlerStatistics>,
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        let mut registry = HandlerRegistry {
            handlers: Vec::new(),
            statistics: KeyedVec::default(),
        };
        registry.register(Box::new(DefaultHandler));
        registry
    }
}

impl HandlerRegistry {
    pub fn new() -> HandlerRegistry {
        HandlerRegistry::default()
    }

    #[cfg(test)]
    pub(crate) fn without_default() -> HandlerRegistry {
        HandlerRegistry {
            handlers: Vec::new(),
            statistics: KeyedVec::default(),
        }
    }

    /// Register a handler. Must happen before the first detection pass.
    pub fn register(&mut self, handler: Box<dyn NonlinearHandler>) {
        self.handlers.push(handler);
        self.handlers = std::mem::take(&mut self.handlers)
            .into_iter()
            .sorted_by(|a, b| {
                b.detection_priority()
                    .cmp(&a.detection_priority())
                    .then_with(|| a.name().cmp(b.name()))
            })
            .collect();
        while self.statistics.len() < self.handlers.len() {
            let _ = self.statistics.push(HandlerStatistics::default());
        }
    }

    pub fn num_handlers(&self) -> usize {
        self.handlers.len()
    }

    pub fn handler(&self, id: HandlerId) -> &dyn NonlinearHandler {
        self.handlers[id.index()].as_ref()
    }

    /// Handler ids in detection order (descending priority).
    pub fn handler_ids(&self) -> impl Iterator<Item = HandlerId> + '_ {
        (0..self.handlers.len()).map(HandlerId::create_from_index)
    }

    pub fn statistics(&self, id: HandlerId) -> &HandlerStatistics {
        &self.statistics[id]
    }

    /// Time a callback on behalf of `id`, folding the sample into the handler's statistics.
    pub(crate) fn timed<R>(
        &mut self,
        id: HandlerId,
        callback: HandlerCallback,
        call: impl FnOnce(&dyn NonlinearHandler) -> R,
    ) -> R {
        let start = Instant::now();
        let result = call(self.handlers[id.index()].as_ref());
        let statistics = &mut self.statistics[id];
        statistics.calls[callback] += 1;
        statistics.time[callback] += start.elapsed();
        result
    }

    pub fn log_statistics(&self, statistic_logger: &StatisticLogger) {
        for id in self.handler_ids() {
            let name = self.handler(id).name().to_owned();
            self.statistics[id].log(statistic_logger.attach_to_prefix(name));
        }
    }
}

#[cfg(test)]
mod tests {
    use enumset::EnumSet;

    use super::*;
    use crate::api::ConstraintId;
    use crate::basic_types::Solution;
    use crate::expr::ExpressionGraph;
    use crate::expr::NodeId;
    use crate::handlers::Capability;
    use crate::handlers::HandlerClaim;
    use crate::variables::VariableStore;

    #[derive(Debug)]
    struct NamedHandler {
        name: &'static str,
        priority: i32,
    }

    impl NonlinearHandler for NamedHandler {
        fn name(&self) -> &str {
            self.name
        }

        fn detection_priority(&self) -> i32 {
            self.priority
        }

        fn enforcement_priority(&self) -> i32 {
            self.priority
        }

        fn detect(
            &self,
            _graph: &ExpressionGraph,
            _variables: &VariableStore,
            _node: NodeId,
            _constraint: Option<ConstraintId>,
            _required: EnumSet<Capability>,
        ) -> Option<HandlerClaim> {
            None
        }

        fn eval_aux(
            &self,
            _graph: &ExpressionGraph,
            _variables: &VariableStore,
            _node: NodeId,
            _data: Option<&dyn super::super::NlHandlerExprData>,
            _solution: &Solution,
        ) -> Option<f64> {
            None
        }
    }

    #[test]
    fn handlers_are_ordered_by_priority_then_name() {
        let mut registry = HandlerRegistry::new();
        registry.register(Box::new(NamedHandler {
            name: "bravo",
            priority: 10,
        }));
        registry.register(Box::new(NamedHandler {
            name: "alpha",
            priority: 10,
        }));
        registry.register(Box::new(NamedHandler {
            name: "zulu",
            priority: 100,
        }));

        let names: Vec<&str> = registry
            .handler_ids()
            .map(|id| registry.handler(id).name())
            .collect();
        // The built-in default handler sits at the very end.
        assert_eq!(names, vec!["zulu", "alpha", "bravo", "default"]);
    }

    #[test]
    fn timed_calls_are_counted() {
        let mut registry = HandlerRegistry::new();
        let id = registry.handler_ids().next().unwrap();
        let name = registry.timed(id, HandlerCallback::Detect, |handler| {
            handler.name().to_owned()
        });
        assert_eq!(name, "default");
        assert_eq!(registry.statistics(id).num_calls(HandlerCallback::Detect), 1);
    }
}
