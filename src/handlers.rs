//! Event dispatch.
//!
//! Every known event type has a fixed internal reaction (the arms of
//! [`HandlerRegistry::dispatch`]) and, for the types that are forwarded, one
//! optional external callback. Callbacks are typed per event: a
//! `BalanceRequested` handler receives a [`BalanceRequested`], an
//! `NftLinkStatusChanged` handler receives only the nested [`NftLinkStatus`].
//!
//! Ping is answered internally and never forwarded, so it has no slot.
//!
//! Callbacks run inline on the connection task. Anything slow should be
//! moved onto its own task with `tokio::spawn`.

use crate::error::ChannelError;
use crate::outbox::FrameSink;
use crate::types::{
    BalanceRequested, Event, EventKind, InGameCurrencyDeposit, InGameCurrencyWithdrawal,
    NftLinkStatus, OutboundMessage, RollbackWithdrawal,
};
use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, trace};

pub type Callback<E> = Arc<dyn Fn(&E) -> anyhow::Result<()> + Send + Sync>;

/// Holds at most one callback; registering again replaces it.
pub struct HandlerSlot<E> {
    callback: RwLock<Option<Callback<E>>>,
}

impl<E> Default for HandlerSlot<E> {
    fn default() -> Self {
        Self {
            callback: RwLock::new(None),
        }
    }
}

impl<E> HandlerSlot<E> {
    fn replace(&self, callback: Option<Callback<E>>) -> bool {
        let mut slot = self
            .callback
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *slot, callback).is_some()
    }

    // Clone out so the lock is not held while the callback runs
    fn get(&self) -> Option<Callback<E>> {
        self.callback
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn is_set(&self) -> bool {
        self.callback
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

mod sealed {
    pub trait Sealed {}
}

/// Payload types an external callback can be registered for.
pub trait ExternalEvent: sealed::Sealed + Sized + 'static {
    const KIND: EventKind;

    #[doc(hidden)]
    fn slot(registry: &HandlerRegistry) -> &HandlerSlot<Self>;
}

macro_rules! external_event {
    ($payload:ty, $kind:expr, $field:ident) => {
        impl sealed::Sealed for $payload {}

        impl ExternalEvent for $payload {
            const KIND: EventKind = $kind;

            fn slot(registry: &HandlerRegistry) -> &HandlerSlot<Self> {
                &registry.$field
            }
        }
    };
}

external_event!(
    BalanceRequested,
    EventKind::BalanceRequested,
    balance_requested
);
external_event!(
    InGameCurrencyDeposit,
    EventKind::InGameCurrencyDeposit,
    deposit
);
external_event!(NftLinkStatus, EventKind::NftLinkStatusChanged, nft_link);
external_event!(
    InGameCurrencyWithdrawal,
    EventKind::InGameCurrencyWithdrawal,
    withdrawal
);
external_event!(RollbackWithdrawal, EventKind::RollbackWithdrawal, rollback);

/// External callbacks of one channel.
#[derive(Default)]
pub struct HandlerRegistry {
    balance_requested: HandlerSlot<BalanceRequested>,
    deposit: HandlerSlot<InGameCurrencyDeposit>,
    nft_link: HandlerSlot<NftLinkStatus>,
    withdrawal: HandlerSlot<InGameCurrencyWithdrawal>,
    rollback: HandlerSlot<RollbackWithdrawal>,
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let registered: Vec<EventKind> = EventKind::ALL
            .into_iter()
            .filter(|kind| self.is_registered(*kind))
            .collect();
        f.debug_struct("HandlerRegistry")
            .field("registered", &registered)
            .finish()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the callback for `E`, replacing any earlier one.
    pub fn register<E, F>(&self, callback: F)
    where
        E: ExternalEvent,
        F: Fn(&E) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        if E::slot(self).replace(Some(Arc::new(callback))) {
            debug!(event = %E::KIND, "Replaced external handler");
        } else {
            debug!(event = %E::KIND, "Registered external handler");
        }
    }

    /// Removes the callback for `E`. Returns whether one was set.
    pub fn unregister<E: ExternalEvent>(&self) -> bool {
        E::slot(self).replace(None)
    }

    pub fn is_registered(&self, kind: EventKind) -> bool {
        match kind {
            EventKind::BalanceRequested => self.balance_requested.is_set(),
            EventKind::InGameCurrencyDeposit => self.deposit.is_set(),
            EventKind::NftLinkStatusChanged => self.nft_link.is_set(),
            EventKind::InGameCurrencyWithdrawal => self.withdrawal.is_set(),
            EventKind::RollbackWithdrawal => self.rollback.is_set(),
            EventKind::Ping => false,
        }
    }

    /// Runs the internal reaction for `event`, then the external callback
    /// where the event type is forwarded.
    ///
    /// A failing or panicking callback comes back as
    /// [`ChannelError::Dispatch`]; protocol acknowledgements have already
    /// been handed to `sink` by then.
    pub fn dispatch(&self, event: &Event, sink: &dyn FrameSink) -> Result<(), ChannelError> {
        match event {
            Event::BalanceRequested(requested) => self.forward(requested),
            Event::InGameCurrencyDeposit(deposit) => {
                sink.send(OutboundMessage::Accepted {
                    request_id: deposit.request_id.clone(),
                });
                self.forward(deposit)
            }
            Event::NftLinkStatusChanged(changed) => {
                sink.send(OutboundMessage::Accepted {
                    request_id: changed.request_id.clone(),
                });
                self.forward(&changed.status)
            }
            Event::InGameCurrencyWithdrawal(withdrawal) => self.forward(withdrawal),
            Event::RollbackWithdrawal(rollback) => self.forward(rollback),
            Event::Ping(ping) => {
                sink.send(OutboundMessage::Pong {
                    request_id: ping.request_id.clone(),
                });
                Ok(())
            }
            Event::Unrecognized { tag } => {
                debug!(%tag, "Ignoring unrecognized event");
                Ok(())
            }
        }
    }

    fn forward<E: ExternalEvent>(&self, payload: &E) -> Result<(), ChannelError> {
        let Some(callback) = E::slot(self).get() else {
            trace!(event = %E::KIND, "No external handler registered");
            return Ok(());
        };

        match panic::catch_unwind(AssertUnwindSafe(|| callback(payload))) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(ChannelError::Dispatch {
                kind: E::KIND,
                reason: format!("{e:#}"),
            }),
            Err(panic) => Err(ChannelError::Dispatch {
                kind: E::KIND,
                reason: format!("handler panicked: {}", panic_message(panic.as_ref())),
            }),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encode;
    use crate::outbox::SendOutcome;
    use crate::types::{NftLinkStatusChanged, Ping};
    use pretty_assertions::assert_eq;
    use std::sync::Mutex;

    /// Records encoded frames and callback invocations in one ordered log.
    #[derive(Clone, Default)]
    struct Recorder {
        log: Arc<Mutex<Vec<String>>>,
    }

    impl Recorder {
        fn push(&self, entry: String) {
            self.log.lock().unwrap().push(entry);
        }

        fn entries(&self) -> Vec<String> {
            self.log.lock().unwrap().clone()
        }
    }

    impl FrameSink for Recorder {
        fn send(&self, message: OutboundMessage) -> SendOutcome {
            self.push(format!("frame {}", encode(&message, "T1")));
            SendOutcome::Sent
        }
    }

    fn deposit(request_id: &str) -> Event {
        Event::InGameCurrencyDeposit(InGameCurrencyDeposit {
            request_id: request_id.into(),
            email: "p@g.io".into(),
            balance_increase: 5.0,
            tx_hash: "0xabc".into(),
        })
    }

    fn balance_requested(request_id: &str) -> Event {
        Event::BalanceRequested(BalanceRequested {
            request_id: request_id.into(),
            email: "p@g.io".into(),
        })
    }

    fn nft_status() -> NftLinkStatus {
        NftLinkStatus {
            user_email: "p@g.io".into(),
            wallet_address: "0xw".into(),
            token_address: "0xt".into(),
            status: 1,
            metadata: String::new(),
        }
    }

    #[test]
    fn test_deposit_acknowledged_before_callback() {
        let registry = HandlerRegistry::new();
        let recorder = Recorder::default();

        let log = recorder.clone();
        registry.register(move |event: &InGameCurrencyDeposit| {
            log.push(format!("callback {}", event.request_id));
            Ok(())
        });

        registry.dispatch(&deposit("r1"), &recorder).unwrap();

        assert_eq!(
            recorder.entries(),
            vec!["frame accepted|T1|r1", "callback r1"]
        );
    }

    #[test]
    fn test_deposit_acknowledged_without_callback() {
        let registry = HandlerRegistry::new();
        let recorder = Recorder::default();
        registry.dispatch(&deposit("r2"), &recorder).unwrap();
        assert_eq!(recorder.entries(), vec!["frame accepted|T1|r2"]);
    }

    #[test]
    fn test_ping_answered_with_pong_only() {
        let registry = HandlerRegistry::new();
        let recorder = Recorder::default();

        for kind in EventKind::ALL {
            assert!(!registry.is_registered(kind));
        }
        let log = recorder.clone();
        registry.register(move |_: &BalanceRequested| {
            log.push("callback".into());
            Ok(())
        });

        let ping = Event::Ping(Ping {
            request_id: "p9".into(),
        });
        registry.dispatch(&ping, &recorder).unwrap();

        assert_eq!(recorder.entries(), vec!["frame pong|T1|p9"]);
    }

    #[test]
    fn test_nft_link_forwards_nested_payload_only() {
        let registry = HandlerRegistry::new();
        let recorder = Recorder::default();
        let received = Arc::new(Mutex::new(None));

        let sink = received.clone();
        registry.register(move |status: &NftLinkStatus| {
            *sink.lock().unwrap() = Some(status.clone());
            Ok(())
        });

        let event = Event::NftLinkStatusChanged(NftLinkStatusChanged {
            request_id: "r7".into(),
            status: nft_status(),
        });
        registry.dispatch(&event, &recorder).unwrap();

        assert_eq!(recorder.entries(), vec!["frame accepted|T1|r7"]);
        assert_eq!(*received.lock().unwrap(), Some(nft_status()));
    }

    #[test]
    fn test_requests_needing_answers_are_forwarded_without_frames() {
        let registry = HandlerRegistry::new();
        let recorder = Recorder::default();

        let log = recorder.clone();
        registry.register(move |event: &BalanceRequested| {
            log.push(format!("balance {}", event.request_id));
            Ok(())
        });
        let log = recorder.clone();
        registry.register(move |event: &InGameCurrencyWithdrawal| {
            log.push(format!("withdrawal {}", event.request_id));
            Ok(())
        });
        let log = recorder.clone();
        registry.register(move |event: &RollbackWithdrawal| {
            log.push(format!("rollback {}", event.request_id));
            Ok(())
        });

        registry
            .dispatch(&balance_requested("b1"), &recorder)
            .unwrap();
        registry
            .dispatch(
                &Event::InGameCurrencyWithdrawal(InGameCurrencyWithdrawal {
                    request_id: "w1".into(),
                    email: "p@g.io".into(),
                    balance_decrease: 3.0,
                }),
                &recorder,
            )
            .unwrap();
        registry
            .dispatch(
                &Event::RollbackWithdrawal(RollbackWithdrawal {
                    request_id: "rb1".into(),
                    email: "p@g.io".into(),
                    balance_increase: 3.0,
                    tx_hash: "0x1".into(),
                }),
                &recorder,
            )
            .unwrap();

        assert_eq!(
            recorder.entries(),
            vec!["balance b1", "withdrawal w1", "rollback rb1"]
        );
    }

    #[test]
    fn test_last_registration_wins() {
        let registry = HandlerRegistry::new();
        let recorder = Recorder::default();

        let log = recorder.clone();
        registry.register(move |_: &BalanceRequested| {
            log.push("first".into());
            Ok(())
        });
        let log = recorder.clone();
        registry.register(move |_: &BalanceRequested| {
            log.push("second".into());
            Ok(())
        });

        registry
            .dispatch(&balance_requested("b1"), &recorder)
            .unwrap();
        registry
            .dispatch(&balance_requested("b2"), &recorder)
            .unwrap();

        assert_eq!(recorder.entries(), vec!["second", "second"]);
    }

    #[test]
    fn test_unrecognized_is_noop() {
        let registry = HandlerRegistry::new();
        let recorder = Recorder::default();
        let event = Event::Unrecognized {
            tag: "BadToken".into(),
        };
        registry.dispatch(&event, &recorder).unwrap();
        assert!(recorder.entries().is_empty());
    }

    #[test]
    fn test_failing_callback_is_isolated() {
        let registry = HandlerRegistry::new();
        let recorder = Recorder::default();

        registry.register(|_: &InGameCurrencyDeposit| anyhow::bail!("ledger unavailable"));

        let err = registry.dispatch(&deposit("r1"), &recorder).unwrap_err();
        assert!(matches!(
            err,
            ChannelError::Dispatch {
                kind: EventKind::InGameCurrencyDeposit,
                ..
            }
        ));
        assert!(err.to_string().contains("ledger unavailable"));

        // The acknowledgement went out regardless, and later events still flow
        registry.dispatch(&deposit("r2"), &recorder).unwrap_err();
        assert_eq!(
            recorder.entries(),
            vec!["frame accepted|T1|r1", "frame accepted|T1|r2"]
        );
    }

    #[test]
    fn test_panicking_callback_is_caught() {
        let registry = HandlerRegistry::new();
        let recorder = Recorder::default();

        registry.register(|_: &BalanceRequested| -> anyhow::Result<()> {
            panic!("boom");
        });

        let err = registry
            .dispatch(&balance_requested("b1"), &recorder)
            .unwrap_err();
        assert!(err.to_string().contains("boom"), "got: {err}");

        assert!(registry.unregister::<BalanceRequested>());
        registry
            .dispatch(&balance_requested("b2"), &recorder)
            .unwrap();
    }

    #[test]
    fn test_registries_are_independent() {
        let first = HandlerRegistry::new();
        let second = HandlerRegistry::new();
        first.register(|_: &RollbackWithdrawal| Ok(()));
        assert!(first.is_registered(EventKind::RollbackWithdrawal));
        assert!(!second.is_registered(EventKind::RollbackWithdrawal));
    }
}
