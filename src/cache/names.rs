/// The namespaces owned by one worker version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheNames {
  pub precache: String,
  pub runtime: String,
}

impl CacheNames {
  pub fn new(prefix: &str, version: &str) -> Self {
    Self {
      precache: format!("{}-precache-{}", prefix, version),
      runtime: format!("{}-runtime-{}", prefix, version),
    }
  }

  /// Lookup order for reads. Refreshed copies land in the runtime
  /// namespace, so it shadows the install-time snapshot.
  pub fn lookup_order(&self) -> [&str; 2] {
    [self.runtime.as_str(), self.precache.as_str()]
  }

  pub fn is_current(&self, name: &str) -> bool {
    name == self.precache || name == self.runtime
  }
}
