//! Pre-flight request validation against the manifest's capabilities and
//! the conversation's own invariants. Catching these locally saves a
//! round-trip that would fail on any provider.

use crate::error::{Error, ErrorContext};
use crate::manifest::{ChatRequest, ProviderManifest};
use crate::Result;
use std::collections::HashSet;

pub(crate) fn validate_request(manifest: &ProviderManifest, request: &ChatRequest) -> Result<()> {
    if request.messages.is_empty() {
        return Err(Error::validation("request has no messages")
            .with_context(ErrorContext::new().with_field_path("messages")));
    }

    let has_tools = request
        .tools
        .as_ref()
        .map(|t| !t.is_empty())
        .unwrap_or(false);
    if has_tools && !manifest.supports_capability("tools") {
        return Err(Error::validation(format!(
            "provider {} does not support tool calling",
            manifest.id
        ))
        .with_context(ErrorContext::new().with_field_path("tools")));
    }

    if request.stream && !manifest.supports_capability("streaming") {
        return Err(Error::validation(format!(
            "provider {} does not support streaming",
            manifest.id
        ))
        .with_context(ErrorContext::new().with_field_path("stream")));
    }

    let has_images = request.messages.iter().any(|m| m.contains_image());
    if has_images && !manifest.supports_capability("vision") {
        return Err(Error::validation(format!(
            "provider {} does not support image input",
            manifest.id
        ))
        .with_context(ErrorContext::new().with_field_path("messages")));
    }

    validate_tool_result_references(request)?;

    Ok(())
}

/// Every tool_result must reference a tool_use id seen earlier in the
/// same conversation.
fn validate_tool_result_references(request: &ChatRequest) -> Result<()> {
    let mut seen: HashSet<&str> = HashSet::new();

    for (position, message) in request.messages.iter().enumerate() {
        for reference in message.tool_result_refs() {
            if !seen.contains(reference) {
                return Err(Error::validation(format!(
                    "tool result references unknown tool_use id {:?}",
                    reference
                ))
                .with_context(
                    ErrorContext::new().with_field_path(format!("messages[{}]", position)),
                ));
            }
        }
        for id in message.tool_use_ids() {
            seen.insert(id);
        }
    }

    Ok(())
}
