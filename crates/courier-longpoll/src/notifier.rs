// Upstream unsubscribe notification hook. The upstream call itself lives
// with the transport; the subscriber only hands over the finalize outcome.
use crate::connection::Finalize;
use crate::pool::SubscriberId;

pub trait UnsubscribeNotifier: Send {
    /// Takes over finishing the request: the notifier blocks the connection
    /// on the upstream call and finalizes it with `finalize` afterwards.
    fn block_on_unsubscribe(&mut self, subscriber: SubscriberId, finalize: Finalize);
}

impl<F> UnsubscribeNotifier for F
where
    F: FnMut(SubscriberId, Finalize) + Send,
{
    fn block_on_unsubscribe(&mut self, subscriber: SubscriberId, finalize: Finalize) {
        self(subscriber, finalize)
    }
}
