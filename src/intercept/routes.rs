//! Ordered route table classifying GET requests.

use url::{Origin, Url};

use super::types::{FetchRequest, RouteClass};

type Predicate = Box<dyn Fn(&FetchRequest) -> bool + Send + Sync>;

struct Route {
  predicate: Predicate,
  class: RouteClass,
}

/// First matching route wins; unmatched requests get the fallback class.
pub struct Router {
  routes: Vec<Route>,
  fallback: RouteClass,
}

impl Router {
  pub fn new(fallback: RouteClass) -> Self {
    Self {
      routes: Vec::new(),
      fallback,
    }
  }

  /// Default table for an app served from `origin`:
  /// other origins -> cross-origin, `/api/` -> api call, rest -> static asset.
  pub fn for_origin(origin: &Url) -> Self {
    let app_origin: Origin = origin.origin();
    Self::new(RouteClass::StaticAsset)
      .route(
        move |req| req.url.origin() != app_origin,
        RouteClass::CrossOrigin,
      )
      .route(|req| req.url.path().starts_with("/api/"), RouteClass::ApiCall)
  }

  /// Append a route after the existing ones.
  pub fn route<F>(mut self, predicate: F, class: RouteClass) -> Self
  where
    F: Fn(&FetchRequest) -> bool + Send + Sync + 'static,
  {
    self.routes.push(Route {
      predicate: Box::new(predicate),
      class,
    });
    self
  }

  /// Insert a route ahead of the existing ones.
  pub fn prepend<F>(mut self, predicate: F, class: RouteClass) -> Self
  where
    F: Fn(&FetchRequest) -> bool + Send + Sync + 'static,
  {
    self.routes.insert(
      0,
      Route {
        predicate: Box::new(predicate),
        class,
      },
    );
    self
  }

  pub fn classify(&self, request: &FetchRequest) -> RouteClass {
    self
      .routes
      .iter()
      .find(|route| (route.predicate)(request))
      .map(|route| route.class)
      .unwrap_or(self.fallback)
  }
}
