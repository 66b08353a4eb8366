use std::sync::Arc;

use crate::pipeline::PipelineContext;

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<PipelineContext>,
}
