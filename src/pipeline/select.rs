//! Frame selector: keeps only frames matching a manifest-declared
//! predicate. The predicate is compiled once at pipeline build time.

use crate::pipeline::Transform;
use crate::utils::Predicate;
use crate::{BoxStream, Result};
use futures::StreamExt;
use serde_json::Value;

pub struct FrameSelector {
    predicate: Predicate,
}

impl FrameSelector {
    pub fn new(expression: &str) -> Result<Self> {
        let predicate = Predicate::parse(expression).map_err(|e| {
            crate::Error::validation(format!("invalid frame_selector: {}", e))
        })?;
        Ok(Self { predicate })
    }
}

#[async_trait::async_trait]
impl Transform for FrameSelector {
    async fn transform(
        &self,
        input: BoxStream<'static, Value>,
    ) -> Result<BoxStream<'static, Value>> {
        let predicate = self.predicate.clone();

        let stream = input.filter_map(move |result| {
            let predicate = predicate.clone();
            async move {
                match result {
                    Ok(frame) => {
                        if predicate.matches(&frame) {
                            Some(Ok(frame))
                        } else {
                            None
                        }
                    }
                    Err(e) => Some(Err(e)),
                }
            }
        });

        Ok(Box::pin(stream))
    }
}

pub fn create_selector(expression: &str) -> Result<Box<dyn Transform>> {
    Ok(Box::new(FrameSelector::new(expression)?))
}
