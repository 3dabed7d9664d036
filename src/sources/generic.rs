//! Generic source: no active fetching. Items arrive through external
//! pushes (the REST surface inserts them directly); a fetch cycle simply
//! has nothing to pull.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::models::{CandidateArticle, Source, SourceType};

use super::{FetchContext, SourceAdapter};

pub struct GenericAdapter;

#[async_trait]
impl SourceAdapter for GenericAdapter {
    fn kind(&self) -> SourceType {
        SourceType::Generic
    }

    async fn fetch(
        &self,
        _ctx: &FetchContext,
        _source: &Source,
        _cancel: &CancellationToken,
    ) -> anyhow::Result<Vec<CandidateArticle>> {
        Ok(Vec::new())
    }

    fn needs_body_extraction(&self, item: &CandidateArticle) -> bool {
        item.content.trim().is_empty()
    }
}
