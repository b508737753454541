/*!
# Cachestore: namespaced key-value caching for the registry backend

Cachestore is the storage edge of the performance layer. It wraps a remote
key-value store (Redis) behind a client that never fails from the caller's
point of view, so a cache outage only costs latency.

## Key Features

### Failure-swallowing client
- Every transport error is logged and mapped to the operation's empty value
- A `Disabled` client, selected at construction, turns every call into a no-op
- Keys are namespaced with a configurable prefix

### Backends
- `RedisStore` over a reconnecting multiplexed connection, SCAN-based pattern listing
- `MemoryStore` with TTL expiry and glob matching for tests and single-node setups
- Atomic set-if-absent and compare-and-delete for distributed locks

### Configuration
- Embedded defaults, system and user TOML files, `CACHESTORE_` environment variables, CLI flags
- Default TTLs per data category (patient, report, analytics, reference, session)

## Usage

```rust,no_run
use cachestore_core::client::CacheClient;
use cachestore_core::config::StoreConfig;

#[tokio::main]
async fn main() {
    let client = CacheClient::connect(&StoreConfig::default()).await;

    client.set("patient:42:summary", "{\"stage\":\"II\"}", 300).await;
    let cached = client.get("patient:42:summary").await;
    println!("cached: {:?}", cached);

    let removed = client.delete_matching("patient:42:*").await;
    println!("invalidated {} keys", removed);
}
```
*/

pub mod client;
pub mod config;
pub mod error;
pub mod storage;

pub use client::CacheClient;
pub use config::{DataCategory, Settings, StoreConfig, TtlPolicy};
pub use error::{StoreError, StoreResult};
pub use storage::{KvStore, MemoryStore, RedisStore};
