/*!

A thin facade over `kube::Api` for test assertions. Writes are performed eagerly. Reads and deletes
are returned as [`DeferredProbe`]s: values that capture what to do and perform one attempt each time
they are invoked, so that the calling test can poll them with whatever retry policy it likes.

!*/

use crate::error::{self, Result};
use async_trait::async_trait;
use k8s_openapi::{ClusterResourceScope, NamespaceResourceScope};
use kube::api::{DeleteParams, ListParams, PostParams};
use kube::{Api, Client, Resource};
use log::trace;
use serde::de::DeserializeOwned;
use serde::Serialize;
use snafu::{OptionExt, ResultExt};
use std::fmt::Debug;

/// One attempt at a read or write against the cluster, repeatable as often as the caller wants.
#[async_trait]
pub trait DeferredProbe: Send + Sync {
    type Output: Send;

    async fn invoke(&self) -> Result<Self::Output>;
}

/// Chooses the `Api` for an object based on whether its kind is namespaced.
pub trait ScopedApi {
    /// The `Api` addressing a single object. Namespaced kinds without a namespace use the client's
    /// default namespace.
    fn object_api<K>(client: Client, namespace: Option<&str>) -> Api<K>
    where
        K: Resource<Scope = Self, DynamicType = ()>;

    /// The `Api` for listing. Namespaced kinds without a namespace are listed across all
    /// namespaces.
    fn list_api<K>(client: Client, namespace: Option<&str>) -> Api<K>
    where
        K: Resource<Scope = Self, DynamicType = ()>;
}

impl ScopedApi for NamespaceResourceScope {
    fn object_api<K>(client: Client, namespace: Option<&str>) -> Api<K>
    where
        K: Resource<Scope = Self, DynamicType = ()>,
    {
        match namespace {
            Some(namespace) => Api::namespaced(client, namespace),
            None => Api::default_namespaced(client),
        }
    }

    fn list_api<K>(client: Client, namespace: Option<&str>) -> Api<K>
    where
        K: Resource<Scope = Self, DynamicType = ()>,
    {
        match namespace {
            Some(namespace) => Api::namespaced(client, namespace),
            None => Api::all(client),
        }
    }
}

impl ScopedApi for ClusterResourceScope {
    fn object_api<K>(client: Client, _namespace: Option<&str>) -> Api<K>
    where
        K: Resource<Scope = Self, DynamicType = ()>,
    {
        Api::all(client)
    }

    fn list_api<K>(client: Client, _namespace: Option<&str>) -> Api<K>
    where
        K: Resource<Scope = Self, DynamicType = ()>,
    {
        Api::all(client)
    }
}

/// Query options for [`ObjectClient::list`], passed through to the API server.
#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    /// Restrict the list to this namespace. Ignored for cluster-scoped kinds.
    pub namespace: Option<String>,
    /// Label and field selectors, limits, etc.
    pub params: ListParams,
}

impl ListOptions {
    pub fn in_namespace<S>(namespace: S) -> Self
    where
        S: Into<String>,
    {
        Self {
            namespace: Some(namespace.into()),
            ..Self::default()
        }
    }

    pub fn labels(mut self, selector: &str) -> Self {
        self.params = self.params.labels(selector);
        self
    }

    pub fn fields(mut self, selector: &str) -> Self {
        self.params = self.params.fields(selector);
        self
    }
}

/// The name and namespace of an object, captured when a probe is built.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectIdentity {
    pub name: Option<String>,
    pub namespace: Option<String>,
}

impl ObjectIdentity {
    pub fn of<K>(obj: &K) -> Self
    where
        K: Resource,
    {
        let meta = obj.meta();
        Self {
            name: meta.name.clone(),
            namespace: meta.namespace.clone(),
        }
    }

    fn describe(&self, kind: &str) -> String {
        match (&self.namespace, &self.name) {
            (Some(namespace), Some(name)) => format!("{} '{}/{}'", kind, namespace, name),
            (None, Some(name)) => format!("{} '{}'", kind, name),
            (_, None) => kind.to_string(),
        }
    }
}

/// Creates, reads, lists and deletes objects of any kind against one cluster.
#[derive(Clone)]
pub struct ObjectClient {
    client: Client,
}

impl ObjectClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// The underlying k8s client.
    pub fn k8s_client(&self) -> &Client {
        &self.client
    }

    /// Write `obj` now and return the object as stored. Failures reported by the API server, e.g.
    /// an existing object or a missing name, are returned unchanged.
    pub async fn create<K>(&self, obj: &K, params: &PostParams) -> Result<K>
    where
        K: Resource<DynamicType = ()> + Clone + Serialize + DeserializeOwned + Debug,
        K::Scope: ScopedApi,
    {
        let identity = ObjectIdentity::of(obj);
        let what = identity.describe(&K::kind(&()));
        trace!("creating {}", what);
        let api: Api<K> =
            <K::Scope as ScopedApi>::object_api(self.client.clone(), identity.namespace.as_deref());
        api.create(params, obj).await.context(error::StoreSnafu {
            method: "create",
            what,
        })
    }

    /// A probe that reads the object with the name and namespace `obj` has now.
    pub fn get<K>(&self, obj: &K) -> GetProbe<K>
    where
        K: Resource<DynamicType = ()>,
        K::Scope: ScopedApi,
    {
        GetProbe {
            target: Target::new(self.client.clone(), obj),
        }
    }

    /// A probe that lists objects of kind `K` matching `options`.
    pub fn list<K>(&self, options: ListOptions) -> ListProbe<K>
    where
        K: Resource<DynamicType = ()>,
        K::Scope: ScopedApi,
    {
        ListProbe {
            api: <K::Scope as ScopedApi>::list_api(
                self.client.clone(),
                options.namespace.as_deref(),
            ),
            what: match &options.namespace {
                Some(namespace) => format!("{} in '{}'", K::plural(&()), namespace),
                None => K::plural(&()).to_string(),
            },
            params: options.params,
        }
    }

    /// A probe that deletes the object with the name and namespace `obj` has now. The object must
    /// exist when the probe is invoked.
    pub fn delete<K>(&self, obj: &K, params: DeleteParams) -> DeleteProbe<K>
    where
        K: Resource<DynamicType = ()>,
        K::Scope: ScopedApi,
    {
        DeleteProbe {
            target: Target::new(self.client.clone(), obj),
            params,
        }
    }
}

/// The `Api` and identity of a single object.
struct Target<K> {
    api: Api<K>,
    identity: ObjectIdentity,
    what: String,
}

impl<K> Target<K>
where
    K: Resource<DynamicType = ()>,
    K::Scope: ScopedApi,
{
    fn new(client: Client, obj: &K) -> Self {
        let identity = ObjectIdentity::of(obj);
        Self {
            api: <K::Scope as ScopedApi>::object_api(client, identity.namespace.as_deref()),
            what: identity.describe(&K::kind(&())),
            identity,
        }
    }
}

impl<K> Target<K>
where
    K: Resource + Clone + DeserializeOwned + Debug,
{
    fn name(&self, method: &str) -> Result<&str> {
        self.identity
            .name
            .as_deref()
            .filter(|name| !name.is_empty())
            .context(error::MissingNameSnafu {
                method,
                what: &self.what,
            })
    }

    async fn get(&self) -> Result<K> {
        let name = self.name("get")?;
        trace!("getting {}", self.what);
        self.api.get(name).await.context(error::StoreSnafu {
            method: "get",
            what: &self.what,
        })
    }
}

/// Reads one object. See [`ObjectClient::get`].
pub struct GetProbe<K> {
    target: Target<K>,
}

impl<K> GetProbe<K> {
    /// The identity every invocation reads.
    pub fn identity(&self) -> &ObjectIdentity {
        &self.target.identity
    }
}

#[async_trait]
impl<K> DeferredProbe for GetProbe<K>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    type Output = K;

    async fn invoke(&self) -> Result<K> {
        self.target.get().await
    }
}

/// Lists objects. See [`ObjectClient::list`].
pub struct ListProbe<K> {
    api: Api<K>,
    params: ListParams,
    what: String,
}

impl<K> ListProbe<K>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    /// Replace the contents of `items` with the current list.
    pub async fn invoke_into(&self, items: &mut Vec<K>) -> Result<()> {
        *items = self.invoke().await?;
        Ok(())
    }
}

#[async_trait]
impl<K> DeferredProbe for ListProbe<K>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    type Output = Vec<K>;

    /// An empty list is a successful result.
    async fn invoke(&self) -> Result<Vec<K>> {
        trace!("listing {}", self.what);
        Ok(self
            .api
            .list(&self.params)
            .await
            .context(error::StoreSnafu {
                method: "list",
                what: &self.what,
            })?
            .items)
    }
}

/// Deletes one object that must exist. See [`ObjectClient::delete`].
pub struct DeleteProbe<K> {
    target: Target<K>,
    params: DeleteParams,
}

impl<K> DeleteProbe<K> {
    /// The identity every invocation deletes.
    pub fn identity(&self) -> &ObjectIdentity {
        &self.target.identity
    }
}

#[async_trait]
impl<K> DeferredProbe for DeleteProbe<K>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    type Output = ();

    async fn invoke(&self) -> Result<()> {
        // Deleting something that is absent is an error, not a no-op.
        self.target.get().await?;
        let name = self.target.name("delete")?;
        trace!("deleting {}", self.target.what);
        self.target
            .api
            .delete(name, &self.params)
            .await
            .context(error::StoreSnafu {
                method: "delete",
                what: &self.target.what,
            })?;
        Ok(())
    }
}
