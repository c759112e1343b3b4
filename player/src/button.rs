use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::debug;

/// Stand-in for the physical button: every line read is one press. Returns
/// the number of presses once the input closes.
pub async fn press_on_lines<R, F>(reader: R, mut on_press: F) -> std::io::Result<u64>
where
    R: AsyncBufRead + Unpin,
    F: FnMut(),
{
    let mut lines = reader.lines();
    let mut presses = 0;
    while lines.next_line().await?.is_some() {
        presses += 1;
        debug!(presses, "button pressed");
        on_press();
    }
    Ok(presses)
}
