use std::sync::atomic::{AtomicU64, Ordering};

use crate::executor::ExecError;

#[derive(Debug, Default)]
pub struct MetricsRegistry {
    executions_total: AtomicU64,
    executions_succeeded_total: AtomicU64,
    executions_failed_total: AtomicU64,
    executions_timed_out_total: AtomicU64,
    compile_failures_total: AtomicU64,
    toolchain_missing_total: AtomicU64,
    browser_executions_total: AtomicU64,
    broadcasts_total: AtomicU64,
    deliveries_total: AtomicU64,
    active_rooms: AtomicU64,
    connected_clients: AtomicU64,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn browser_execution(&self) {
        self.browser_executions_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn execution_finished(&self, outcome: &Result<String, ExecError>) {
        self.executions_total.fetch_add(1, Ordering::Relaxed);
        let counter = match outcome {
            Ok(_) => &self.executions_succeeded_total,
            Err(ExecError::ExecutionTimeout(_)) => &self.executions_timed_out_total,
            Err(ExecError::CompilationFailed(_)) => &self.compile_failures_total,
            Err(ExecError::ToolchainUnavailable(_)) => &self.toolchain_missing_total,
            Err(_) => &self.executions_failed_total,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn broadcast(&self, deliveries: u64) {
        self.broadcasts_total.fetch_add(1, Ordering::Relaxed);
        self.deliveries_total.fetch_add(deliveries, Ordering::Relaxed);
    }

    pub fn room_opened(&self) {
        self.active_rooms.fetch_add(1, Ordering::Relaxed);
    }

    pub fn room_closed(&self) {
        decrement(&self.active_rooms);
    }

    pub fn client_connected(&self) {
        self.connected_clients.fetch_add(1, Ordering::Relaxed);
    }

    pub fn client_disconnected(&self) {
        decrement(&self.connected_clients);
    }

    pub fn render_prometheus(&self) -> String {
        format!(
            concat!(
                "# TYPE codepair_executions_total counter\n",
                "codepair_executions_total {}\n",
                "# TYPE codepair_executions_succeeded_total counter\n",
                "codepair_executions_succeeded_total {}\n",
                "# TYPE codepair_executions_failed_total counter\n",
                "codepair_executions_failed_total {}\n",
                "# TYPE codepair_executions_timed_out_total counter\n",
                "codepair_executions_timed_out_total {}\n",
                "# TYPE codepair_compile_failures_total counter\n",
                "codepair_compile_failures_total {}\n",
                "# TYPE codepair_toolchain_missing_total counter\n",
                "codepair_toolchain_missing_total {}\n",
                "# TYPE codepair_browser_executions_total counter\n",
                "codepair_browser_executions_total {}\n",
                "# TYPE codepair_broadcasts_total counter\n",
                "codepair_broadcasts_total {}\n",
                "# TYPE codepair_deliveries_total counter\n",
                "codepair_deliveries_total {}\n",
                "# TYPE codepair_active_rooms gauge\n",
                "codepair_active_rooms {}\n",
                "# TYPE codepair_connected_clients gauge\n",
                "codepair_connected_clients {}\n"
            ),
            self.executions_total.load(Ordering::Relaxed),
            self.executions_succeeded_total.load(Ordering::Relaxed),
            self.executions_failed_total.load(Ordering::Relaxed),
            self.executions_timed_out_total.load(Ordering::Relaxed),
            self.compile_failures_total.load(Ordering::Relaxed),
            self.toolchain_missing_total.load(Ordering::Relaxed),
            self.browser_executions_total.load(Ordering::Relaxed),
            self.broadcasts_total.load(Ordering::Relaxed),
            self.deliveries_total.load(Ordering::Relaxed),
            self.active_rooms.load(Ordering::Relaxed),
            self.connected_clients.load(Ordering::Relaxed),
        )
    }
}

fn decrement(gauge: &AtomicU64) {
    let mut current = gauge.load(Ordering::Relaxed);
    while current > 0 {
        match gauge.compare_exchange_weak(current, current - 1, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => return,
            Err(actual) => current = actual,
        }
    }
}
