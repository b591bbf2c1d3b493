//! Candidate fan-out: splits multi-candidate frames into one frame per
//! candidate so downstream stages see a single logical stream each.

use crate::manifest::CandidateConfig;
use crate::pipeline::Transform;
use crate::utils::json_path::JsonPath;
use crate::{BoxStream, Result};
use futures::StreamExt;
use serde_json::Value;

pub struct CandidateFanOut {
    candidates_path: Option<JsonPath>,
}

impl CandidateFanOut {
    pub fn new(config: &CandidateConfig) -> Result<Self> {
        let candidates_path = match config.candidates_path.as_deref() {
            Some(p) => Some(JsonPath::parse(p).map_err(|e| {
                crate::Error::validation(format!("candidate.candidates_path: {}", e))
            })?),
            None => None,
        };
        Ok(Self { candidates_path })
    }

    fn split(&self, frame: Value) -> Vec<Value> {
        // Configured path first; a bare array frame splits by itself.
        if let Some(path) = &self.candidates_path {
            if let Some(arr) = path.first(&frame).and_then(|v| v.as_array()) {
                return arr.to_vec();
            }
            return vec![frame];
        }
        match frame {
            Value::Array(items) => items,
            other => vec![other],
        }
    }
}

#[async_trait::async_trait]
impl Transform for CandidateFanOut {
    async fn transform(
        &self,
        input: BoxStream<'static, Value>,
    ) -> Result<BoxStream<'static, Value>> {
        let path = self.candidates_path.clone();

        let stream = input.flat_map(move |result| {
            let splitter = CandidateFanOut {
                candidates_path: path.clone(),
            };
            match result {
                Ok(frame) => futures::stream::iter(
                    splitter.split(frame).into_iter().map(Ok).collect::<Vec<_>>(),
                ),
                Err(e) => futures::stream::iter(vec![Err(e)]),
            }
        });

        Ok(Box::pin(stream))
    }
}

pub fn create_fan_out(config: &CandidateConfig) -> Result<Box<dyn Transform>> {
    Ok(Box::new(CandidateFanOut::new(config)?))
}
