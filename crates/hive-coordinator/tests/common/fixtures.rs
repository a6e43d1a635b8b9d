//! Test fixtures for coordinator integration tests.

use hive_proto::{
    DeclaredCapabilities, HeartbeatRequest, LoadMetrics, RegisterRequest, ServiceDeclaration,
    ServiceHealth,
};

/// Builder for registration payloads.
pub struct WorkerBuilder {
    id: String,
    address: String,
    capabilities: DeclaredCapabilities,
    services: Vec<ServiceDeclaration>,
    group: Option<String>,
}

impl WorkerBuilder {
    /// Creates a CPU worker with a private address and no services.
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            address: format!("http://{id}.workers.internal:8000"),
            capabilities: DeclaredCapabilities {
                cpu_cores: Some(8),
                ram_mb: Some(16_384),
                ..DeclaredCapabilities::default()
            },
            services: vec![],
            group: None,
        }
    }

    /// Sets the worker's address.
    pub fn with_address(mut self, address: &str) -> Self {
        self.address = address.to_string();
        self
    }

    /// Adds a plain healthy service.
    pub fn with_service(mut self, name: &str) -> Self {
        self.services.push(ServiceDeclaration::new(name));
        self
    }

    /// Adds a fully specified service.
    pub fn with_declaration(mut self, declaration: ServiceDeclaration) -> Self {
        self.services.push(declaration);
        self
    }

    /// Adds a service with a specialization.
    pub fn with_specialized_service(mut self, name: &str, specialization: &str) -> Self {
        self.services
            .push(ServiceDeclaration::new(name).with_specialization(specialization));
        self
    }

    /// Declares a GPU.
    pub fn with_gpu(mut self, model: &str, memory_mb: u64) -> Self {
        self.capabilities.gpu_model = Some(model.to_string());
        self.capabilities.gpu_memory_mb = Some(memory_mb);
        self
    }

    /// Joins a heartbeat group.
    pub fn in_group(mut self, group: &str) -> Self {
        self.group = Some(group.to_string());
        self
    }

    /// Builds the registration request.
    pub fn build(self) -> RegisterRequest {
        let mut request = RegisterRequest::new(self.address)
            .with_worker_id(self.id)
            .with_capabilities(self.capabilities);
        for service in self.services {
            request = request.with_service(service);
        }
        if let Some(group) = self.group {
            request = request.with_heartbeat_group(group);
        }
        request
    }
}

/// Heartbeat reporting `cpu_load` and nothing else.
pub fn heartbeat(cpu_load: f64) -> HeartbeatRequest {
    HeartbeatRequest::new(LoadMetrics::with_cpu_load(cpu_load))
}

/// Heartbeat reporting one service's health.
pub fn heartbeat_with_health(service: &str, health: ServiceHealth) -> HeartbeatRequest {
    HeartbeatRequest::new(LoadMetrics::default()).with_service_health(service, health)
}
