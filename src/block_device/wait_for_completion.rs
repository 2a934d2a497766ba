use super::*;

/// Polls `channel` until `request_id` completes or `timeout` elapses and
/// returns its status. Only the timeout is reported as an error.
pub fn wait_for_status(
    channel: &mut dyn IoChannel,
    request_id: usize,
    timeout: std::time::Duration,
) -> Result<IoStatus> {
    let start = std::time::Instant::now();
    loop {
        let completions = channel.poll();
        for (id, status) in completions.into_iter() {
            if id == request_id {
                return Ok(status);
            }
        }
        if start.elapsed() >= timeout {
            break;
        }
        if !channel.busy() {
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
    }
    Err(crate::rekey_error!(IoError {
        source: std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            format!("Timeout while waiting for request ID {request_id}"),
        ),
    }))
}

pub fn wait_for_completion(
    channel: &mut dyn IoChannel,
    request_id: usize,
    timeout: std::time::Duration,
) -> Result<()> {
    match wait_for_status(channel, request_id, timeout)? {
        IoStatus::Success => Ok(()),
        status => Err(crate::rekey_error!(IoError {
            source: std::io::Error::other(format!(
                "Failed request ID: {request_id} ({status:?})"
            )),
        })),
    }
}
