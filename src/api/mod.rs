//! Ports to the outside world: execution venues and the providers around them.

mod paper;
mod providers;
mod venue;

pub use paper::{PaperPosition, PaperVenue};
#[cfg(test)]
pub use providers::RecordingNotifier;
pub use providers::{
    AccountProvider, BlackoutProvider, FanoutNotifier, FixedEquity, Impact, LogNotifier,
    NewsCalendar, NewsEvent, NoBlackout, Notification, NotificationSink, WebhookNotifier,
};
pub use venue::{find_order, place_order, ExecutionVenue, OrderRequest, RetryPolicy, VenuePosition};
