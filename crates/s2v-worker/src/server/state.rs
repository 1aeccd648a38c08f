use std::sync::Arc;
use crate::handler::JobHandler;

pub struct ServerState<G> {
    pub handler: Arc<JobHandler<G>>,
    pub max_body_bytes: usize,
}

impl<G> ServerState<G> {
    pub fn new(handler: Arc<JobHandler<G>>, max_body_bytes: usize) -> Self {
        Self { handler, max_body_bytes }
    }
}
