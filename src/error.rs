#[derive(thiserror::Error, Debug)]
pub(crate) enum ServerError {
    #[error("No users configured; pass at least one --user NAME:PASSWORD")]
    NoUsersConfigured,
}
