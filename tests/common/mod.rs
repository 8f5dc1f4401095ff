pub(crate) struct ServerHandle(pub(crate) tokio::task::JoinHandle<color_eyre::Result<()>>);

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.0.abort();
    }
}
