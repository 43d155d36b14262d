use bon::Builder;

/// Configuration for a single [`Endpoint`](crate::Endpoint).
#[derive(Debug, Clone, Builder)]
pub struct EndpointConfig {
    /// Label attached to the endpoint's tracing span (e.g., "client", "nvim").
    #[builder(default = "endpoint".to_string())]
    pub name: String,

    /// Largest number of bytes a single inbound message may occupy.
    /// The dispatch loop fails with an I/O error once a partial message grows past it.
    #[builder(default = 16 * 1024 * 1024)]
    pub max_message_size: usize,

    /// Initial capacity of the read buffer.
    #[builder(default = 8 * 1024)]
    pub read_buffer_capacity: usize,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}
