//! Swarm aggregate

/// Maximum of the local value and every known peer value.
///
/// `None` until the local value has been generated, whatever the peers
/// report.
pub fn aggregate<I>(local: Option<i64>, peers: I) -> Option<i64>
where
    I: IntoIterator<Item = i64>,
{
    let local = local?;
    Some(peers.into_iter().fold(local, i64::max))
}
