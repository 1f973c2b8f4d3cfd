use crate::Error;

/// Item carried by every channel of the bridge.
///
/// Completion travels in-band, so neither side ever learns about the end of a channel by way of
/// an error from the channel itself.
#[derive(Debug)]
pub(crate) enum Signal<T> {
    Value(T),
    /// Nothing follows. Carries the failure that ended the channel, if any.
    End(Option<Error>),
}
