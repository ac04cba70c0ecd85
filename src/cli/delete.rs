//! Delete command implementation

use anyhow::{bail, Result};

use super::{print_json, Target};

pub async fn run(
    target: &Target<'_>,
    session_id: &str,
    user_message_uuid: &str,
    fallback: Option<&str>,
    json: bool,
) -> Result<()> {
    let outcome = target
        .provider
        .delete_message_pair(session_id, user_message_uuid, fallback, target.remote())
        .await;

    if json {
        return print_json(&outcome);
    }

    match (outcome.success, outcome.records_removed) {
        (true, Some(count)) => {
            println!("Deleted exchange {} ({} records removed).", user_message_uuid, count);
            Ok(())
        }
        (true, None) => Ok(()),
        (false, _) => bail!(
            "Delete failed: {}",
            outcome.error.as_deref().unwrap_or("unknown error")
        ),
    }
}
