//! Empty source: nothing to fetch, zero layers.

use stratum_core::error::Result;

use super::{ConveyorState, GetContext, StagedImage};

#[derive(Debug, Default)]
pub struct ScratchConveyor {
    pub(crate) state: ConveyorState,
}

impl ScratchConveyor {
    pub(crate) async fn fetch(&self, _ctx: &GetContext) -> Result<StagedImage> {
        tracing::debug!("Scratch source, nothing to fetch");
        Ok(StagedImage::default())
    }
}
