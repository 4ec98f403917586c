//! Standard tag keys and operation names.
//!
//! Spans may carry arbitrary tags; dispatch layers and tracer backends that
//! want cross-client consistency should prefer these constants.

/// Standard span tag keys.
pub mod tags {
    /// Kind of the span, e.g. `"client"`.
    pub const SPAN_KIND: &str = "span.kind";

    /// The database system the client talks to.
    pub const DB_SYSTEM: &str = "db.system";

    /// Bucket or database name.
    pub const DB_INSTANCE: &str = "db.instance";

    /// The operation for the span. Set unless [`DB_STATEMENT`] has been set.
    pub const DB_OPERATION: &str = "db.operation";

    /// The statement used in this span, when applicable. This is set for
    /// query-like operations instead of [`DB_OPERATION`].
    pub const DB_STATEMENT: &str = "db.statement";

    /// The client component name and version, e.g. `"dbtrace/0.1.0"`.
    pub const COMPONENT: &str = "db.client.component";

    /// The service type, one of `kv`, `query`, `views`, `search`,
    /// `analytics`.
    pub const SERVICE: &str = "db.client.service";

    /// The unique ID of the operation, as put on the wire.
    pub const OPERATION_ID: &str = "db.client.operation_id";

    /// The client's connection identifier string, used to look up
    /// per-connection state in server logs.
    pub const LOCAL_ID: &str = "db.client.local_id";

    /// The server-side processing duration in microseconds, as reported in
    /// the server response.
    pub const SERVER_DURATION_US: &str = "db.client.server_duration_us";

    /// The scope used for this span.
    pub const SCOPE: &str = "db.client.scope";

    /// The collection used for this span.
    pub const COLLECTION: &str = "db.client.collection";

    /// The durability of the operation in this span, when applicable.
    pub const DURABILITY: &str = "db.client.durability";

    /// The number of retries performed in the span.
    pub const RETRIES: &str = "db.client.retries";

    /// The local socket hostname or IP.
    pub const LOCAL_ADDRESS: &str = "net.host.name";

    /// The local socket port.
    pub const LOCAL_PORT: &str = "net.host.port";

    /// The remote socket hostname or IP.
    pub const PEER_ADDRESS: &str = "net.peer.name";

    /// The remote socket port.
    pub const PEER_PORT: &str = "net.peer.port";

    /// Duration of the most recent dispatch attempt, written on the parent
    /// when a dispatch child finishes. Microseconds.
    pub const LAST_DISPATCH_DURATION_US: &str = "db.client.last_dispatch_duration_us";

    /// Accumulated duration of all dispatch attempts, written on the parent
    /// when a dispatch child finishes. Microseconds.
    pub const TOTAL_DISPATCH_DURATION_US: &str = "db.client.total_dispatch_duration_us";

    /// Accumulated request encoding duration, written on the parent when an
    /// encode child finishes. Microseconds.
    pub const ENCODE_DURATION_US: &str = "db.client.encode_duration_us";

    /// Server duration of the most recent dispatch attempt, copied up from
    /// the child's [`SERVER_DURATION_US`]. Microseconds.
    pub const LAST_SERVER_DURATION_US: &str = "db.client.last_server_duration_us";

    /// Accumulated server duration across dispatch attempts. Microseconds.
    pub const TOTAL_SERVER_DURATION_US: &str = "db.client.total_server_duration_us";

    /// `host:port` of the remote socket of the most recent dispatch attempt.
    pub const LAST_REMOTE_SOCKET: &str = "db.client.last_remote_socket";

    /// `host:port` of the local socket of the most recent dispatch attempt.
    pub const LAST_LOCAL_SOCKET: &str = "db.client.last_local_socket";

    /// Connection identifier of the most recent dispatch attempt.
    pub const LAST_LOCAL_ID: &str = "db.client.last_local_id";

    /// Operation ID of the most recent dispatch attempt.
    pub const LAST_OPERATION_ID: &str = "db.client.last_operation_id";
}

/// Standard span operation names.
pub mod operations {
    /// Encoding of the client request.
    pub const REQUEST_ENCODING: &str = "request_encoding";

    /// One dispatch attempt over a socket, ending when the response arrives.
    pub const DISPATCH: &str = "dispatch";

    /// Decoding of the server response.
    pub const RESPONSE_DECODING: &str = "response_decoding";

    /// Document fetch.
    pub const GET: &str = "get";
    /// Document fetch from a replica.
    pub const GET_FROM_REPLICA: &str = "get_from_replica";
    /// Unconditional store.
    pub const UPSERT: &str = "upsert";
    /// Store if absent.
    pub const INSERT: &str = "insert";
    /// Store if present.
    pub const REPLACE: &str = "replace";
    /// Document removal.
    pub const REMOVE: &str = "remove";
    /// Append to an existing value.
    pub const APPEND: &str = "append";
    /// Prepend to an existing value.
    pub const PREPEND: &str = "prepend";
    /// Expiry update.
    pub const TOUCH: &str = "touch";
    /// Lock release.
    pub const UNLOCK: &str = "unlock";
    /// Existence check.
    pub const EXISTS: &str = "exists";
    /// Atomic counter mutation.
    pub const COUNTER: &str = "counter";
    /// Durability observation by CAS.
    pub const OBSERVE_CAS: &str = "observe_cas";
    /// Durability observation by sequence number.
    pub const OBSERVE_SEQNO: &str = "observe_seqno";
    /// Sub-document read.
    pub const LOOKUP_IN: &str = "lookup_in";
    /// Sub-document mutation.
    pub const MUTATE_IN: &str = "mutate_in";
    /// SQL-like query.
    pub const QUERY: &str = "query";
    /// Analytical query.
    pub const ANALYTICS: &str = "analytics";
    /// Full-text search.
    pub const SEARCH: &str = "search";
    /// Map-reduce view query.
    pub const VIEWS: &str = "views";
}
