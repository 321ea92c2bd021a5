// Resilient client for murmur connections.
//
// CLIENT-SIDE DESIGN INTENT
// -------------------------
// A single supervisor task owns the socket and every state transition.
// Callers talk to it over a command channel and get results back on oneshot
// replies, so there is no locking around the connection itself and no
// callback re-entrancy:
//
// - connectivity is a `watch` channel of booleans,
// - transport errors are a `broadcast` channel of strings, reported there
//   and never thrown into unrelated call sites,
// - decoded inbound envelopes fan out on a `broadcast` channel; every
//   waiter gets its own clone with an independent read cursor.
//
// Sends issued while the connection is down are parked in the supervisor
// and drive the backoff loop; each parked send is bounded by a connection
// attempt budget and resolves as an explicit error once that budget is
// spent, rather than hanging forever.

mod client;
mod config;
mod pool;
mod subscription;


pub use client::Client;
pub use config::ClientConfig;
pub use pool::SubscriptionPool;
pub use subscription::Subscription;
