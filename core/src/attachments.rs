//! Turn chat file attachments into agent content blocks. Images are passed
//! through as base64 blocks; anything else is summarized as text since the
//! agent can read it from disk if it matters.

use std::sync::Arc;

use serde_json::Value;

use tether_platform::ChatPlatform;

use crate::protocol;

const MAX_IMAGE_BYTES: u64 = 8 * 1024 * 1024;

fn is_image(mime_type: &str) -> bool {
    mime_type.starts_with("image/")
}

/// Download the given file ids and build content blocks for the ones that
/// could be fetched. Failures degrade to a note so the message still goes
/// through.
pub async fn blocks_for_files(
    platform: &Arc<dyn ChatPlatform>,
    file_ids: &[String],
) -> Vec<Value> {
    let mut blocks = Vec::new();
    for file_id in file_ids {
        let info = match platform.get_file_info(file_id).await {
            Ok(info) => info,
            Err(e) => {
                tracing::warn!("could not stat attachment {file_id}: {e}");
                continue;
            }
        };
        if !is_image(&info.mime_type) {
            blocks.push(protocol::text_block(&format!(
                "[attachment: {} ({}, {} bytes) - not forwarded]",
                info.name, info.mime_type, info.size
            )));
            continue;
        }
        if info.size > MAX_IMAGE_BYTES {
            blocks.push(protocol::text_block(&format!(
                "[image {} skipped: {} bytes exceeds the forwarding limit]",
                info.name, info.size
            )));
            continue;
        }
        match platform.download_file(file_id).await {
            Ok(bytes) => blocks.push(protocol::image_block(&info.mime_type, &bytes)),
            Err(e) => {
                tracing::warn!("could not download attachment {file_id}: {e}");
            }
        }
    }
    blocks
}
