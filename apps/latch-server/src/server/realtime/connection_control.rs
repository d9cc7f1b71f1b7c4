use uuid::Uuid;

use super::connection_registry::ConnectionHandle;
use crate::server::core::CloseReason;

pub(crate) fn signal_close(handles: &[ConnectionHandle], targets: &[Uuid], reason: CloseReason) {
    for handle in handles {
        if targets.contains(&handle.connection_id()) {
            handle.close(reason);
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::{mpsc, watch};
    use uuid::Uuid;

    use super::signal_close;
    use crate::server::{
        core::{CloseReason, ConnectionControl},
        realtime::connection_registry::ConnectionHandle,
    };

    #[test]
    fn closes_only_requested_connections() {
        let (first_tx, first_rx) = watch::channel(ConnectionControl::Open);
        let (second_tx, second_rx) = watch::channel(ConnectionControl::Open);
        let first = ConnectionHandle::new(mpsc::channel(1).0, first_tx);
        let second = ConnectionHandle::new(mpsc::channel(1).0, second_tx);

        signal_close(
            &[first.clone(), second],
            &[first.connection_id(), Uuid::new_v4()],
            CloseReason::SlowConsumer,
        );

        assert_eq!(
            *first_rx.borrow(),
            ConnectionControl::Close(CloseReason::SlowConsumer)
        );
        assert_eq!(*second_rx.borrow(), ConnectionControl::Open);
    }
}
