use crate::authority::{Authority, AuthorityError, AuthorityMaterial, AuthorityFuture};
use crate::prelude::{debug, warn};
use spiffe::{WorkloadApiClient, X509Context};
use tokio::sync::Mutex;

/// Fetches identity material from a SPIFFE Workload API endpoint.
///
/// The client connection is created lazily on the first fetch and dropped
/// after any failed call, so the next fetch reconnects.
pub struct WorkloadApiAuthority {
    endpoint: String,
    client: Mutex<Option<WorkloadApiClient>>,
}

impl std::fmt::Debug for WorkloadApiAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkloadApiAuthority")
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

impl WorkloadApiAuthority {
    /// Creates an authority for `endpoint`, e.g. `unix:///tmp/spire-agent/public/api.sock`.
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            client: Mutex::new(None),
        }
    }

    /// The configured endpoint address.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn load(&self) -> Result<AuthorityMaterial, AuthorityError> {
        let mut slot = self.client.lock().await;

        if slot.is_none() {
            debug!("connecting to Workload API at {}", self.endpoint);
            let client = WorkloadApiClient::new_from_path(self.endpoint.as_str())
                .await
                .map_err(|e| AuthorityError::Unavailable(e.to_string()))?;
            *slot = Some(client);
        }

        let Some(client) = slot.as_mut() else {
            return Err(AuthorityError::Closed);
        };

        match client.fetch_x509_context().await {
            Ok(ctx) => material_from_context(&ctx),
            Err(e) => {
                warn!("Workload API fetch failed; dropping client: {e}");
                *slot = None;
                Err(AuthorityError::WorkloadApi(e.to_string()))
            }
        }
    }
}

fn material_from_context(ctx: &X509Context) -> Result<AuthorityMaterial, AuthorityError> {
    let svid = ctx
        .default_svid()
        .ok_or_else(|| AuthorityError::MalformedResponse("no X.509 SVID in response".into()))?;

    let trust_domain = svid.spiffe_id().trust_domain();
    let bundle = ctx.bundle_set().bundle_for(trust_domain).ok_or_else(|| {
        AuthorityError::MalformedResponse(format!("no trust bundle for {trust_domain}"))
    })?;

    let cert_chain = svid
        .cert_chain()
        .iter()
        .map(|c| AsRef::<[u8]>::as_ref(c).to_vec())
        .collect();
    let private_key = AsRef::<[u8]>::as_ref(svid.private_key()).to_vec();
    let trust_bundle = bundle
        .authorities()
        .iter()
        .map(|c| AsRef::<[u8]>::as_ref(c).to_vec())
        .collect();

    Ok(AuthorityMaterial::new(cert_chain, private_key, trust_bundle))
}

impl Authority for WorkloadApiAuthority {
    fn fetch(&self) -> AuthorityFuture<'_> {
        Box::pin(self.load())
    }

    fn close(&self) {
        // A fetch in flight holds the lock; it is cancelled with the source task.
        if let Ok(mut slot) = self.client.try_lock() {
            slot.take();
        }
    }
}
