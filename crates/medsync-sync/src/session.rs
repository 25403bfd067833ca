//! Connect/disconnect lifecycle around the exclusive portal session.

use medsync_portal::{Credentials, LaunchOptions, PortalConnector, PortalError, PortalSession};
use tokio::time::timeout;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
}

pub struct SessionController<C: PortalConnector> {
    connector: C,
    portal_url: String,
    options: LaunchOptions,
    state: SessionState,
    session: Option<C::Session>,
}

impl<C: PortalConnector> SessionController<C> {
    pub fn new(connector: C, portal_url: impl Into<String>, options: LaunchOptions) -> Self {
        Self {
            connector,
            portal_url: portal_url.into(),
            options,
            state: SessionState::Disconnected,
            session: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == SessionState::Connected
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    /// Launch, login and the cleanup close after a failed login are each bounded by
    /// `LaunchOptions::default_timeout`.
    pub async fn connect(&mut self, credentials: &Credentials) -> Result<(), PortalError> {
        if self.state != SessionState::Disconnected {
            debug!(state = ?self.state, "connect ignored, session already active");
            return Ok(());
        }
        if !credentials.is_complete() {
            return Err(PortalError::MissingCredentials);
        }

        self.state = SessionState::Connecting;
        let limit = self.options.default_timeout;
        let launched = timeout(limit, self.connector.launch(&self.options))
            .await
            .unwrap_or(Err(PortalError::Timeout {
                step: "launch",
                after: limit,
            }));
        let mut session = match launched {
            Ok(session) => session,
            Err(err) => {
                self.state = SessionState::Disconnected;
                return Err(as_login_error(err));
            }
        };

        let logged_in = timeout(limit, session.login(&self.portal_url, credentials))
            .await
            .unwrap_or(Err(PortalError::Timeout {
                step: "login",
                after: limit,
            }));
        if let Err(err) = logged_in {
            match timeout(limit, session.close()).await {
                Ok(Ok(())) => {}
                Ok(Err(close_err)) => {
                    warn!(error = %close_err, "closing session after failed login")
                }
                Err(_) => warn!("closing session after failed login timed out"),
            }
            self.state = SessionState::Disconnected;
            return Err(as_login_error(err));
        }

        self.session = Some(session);
        self.state = SessionState::Connected;
        info!(url = %self.portal_url, headless = self.options.headless, "portal session connected");
        Ok(())
    }

    pub async fn disconnect(&mut self) -> Result<(), PortalError> {
        if self.state != SessionState::Connected {
            return Err(PortalError::NotConnected);
        }
        self.state = SessionState::Disconnected;
        if let Some(mut session) = self.session.take() {
            if let Err(err) = session.close().await {
                warn!(error = %err, "portal session did not close cleanly");
            }
        }
        info!("portal session closed");
        Ok(())
    }

    /// The live session, or `NotConnected` outside the connected state.
    pub fn session_mut(&mut self) -> Result<&mut C::Session, PortalError> {
        match (self.state, self.session.as_mut()) {
            (SessionState::Connected, Some(session)) => Ok(session),
            _ => Err(PortalError::NotConnected),
        }
    }
}

fn as_login_error(err: PortalError) -> PortalError {
    if err.is_domain() {
        err
    } else {
        PortalError::Login(err.to_string())
    }
}
