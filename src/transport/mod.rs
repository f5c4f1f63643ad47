//! The typed request/response seam between the client and the wire.
//!
//! Wire framing, connection pooling, and TLS live behind [`Transport`]; the
//! client only ever sees typed `kafka_protocol` request and response
//! structs. The consumer core needs exactly three calls: Metadata, Fetch,
//! and ListOffsets.

use async_trait::async_trait;
use kafka_protocol::messages::{
    FetchRequest, FetchResponse, ListOffsetsRequest, ListOffsetsResponse, MetadataRequest,
    MetadataResponse,
};

use crate::error::Result;

/// A broker as advertised by cluster metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerEndpoint {
    pub node_id: i32,
    pub host: String,
    pub port: i32,
    pub rack: Option<String>,
}

/// Marshals typed requests to brokers and returns typed responses or a
/// transport error.
///
/// Implementations route by broker id; metadata may be answered by any
/// bootstrap or known broker. All methods take `&self`: implementations
/// are expected to be internally synchronized and cheap to share via
/// `Arc`.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Load cluster metadata from any available broker.
    async fn metadata(&self, request: MetadataRequest) -> Result<MetadataResponse>;

    /// Issue a fetch to a specific broker.
    async fn fetch(&self, broker: i32, request: FetchRequest) -> Result<FetchResponse>;

    /// Resolve offsets on a specific broker.
    async fn list_offsets(
        &self,
        broker: i32,
        request: ListOffsetsRequest,
    ) -> Result<ListOffsetsResponse>;
}
