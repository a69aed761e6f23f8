//! Navigation table of the operator UI and the resolver that loads views.

use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ViewId {
    Login,
    Dashboard,
    Monitoring,
    RobotManagement,
    PointCloud,
    Stats,
    Settings,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadMode {
    Eager,
    Lazy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    pub path: &'static str,
    pub name: &'static str,
    pub title: &'static str,
    pub view: ViewId,
    pub parent: Option<ViewId>,
    pub load: LoadMode,
}

pub const ROUTES: &[Route] = &[
    Route {
        path: "/",
        name: "login",
        title: "Login",
        view: ViewId::Login,
        parent: None,
        load: LoadMode::Eager,
    },
    Route {
        path: "/dashboard",
        name: "dashboard",
        title: "Dashboard",
        view: ViewId::Dashboard,
        parent: None,
        load: LoadMode::Eager,
    },
    Route {
        path: "/dashboard/monitoring",
        name: "monitoring",
        title: "Real-time monitoring",
        view: ViewId::Monitoring,
        parent: Some(ViewId::Dashboard),
        load: LoadMode::Lazy,
    },
    Route {
        path: "/dashboard/robot-management",
        name: "robot-management",
        title: "Robot management",
        view: ViewId::RobotManagement,
        parent: Some(ViewId::Dashboard),
        load: LoadMode::Lazy,
    },
    Route {
        path: "/dashboard/point-cloud",
        name: "point-cloud",
        title: "Point cloud viewer",
        view: ViewId::PointCloud,
        parent: Some(ViewId::Dashboard),
        load: LoadMode::Eager,
    },
    Route {
        path: "/dashboard/stats",
        name: "stats",
        title: "Stats",
        view: ViewId::Stats,
        parent: Some(ViewId::Dashboard),
        load: LoadMode::Lazy,
    },
    Route {
        path: "/dashboard/settings",
        name: "settings",
        title: "Settings",
        view: ViewId::Settings,
        parent: Some(ViewId::Dashboard),
        load: LoadMode::Lazy,
    },
];

/// Exact match after dropping a trailing slash; no query or dynamic
/// segments.
pub fn resolve(path: &str) -> Option<&'static Route> {
    let path = match path.trim_end_matches('/') {
        "" => "/",
        trimmed => trimmed,
    };
    ROUTES.iter().find(|route| route.path == path)
}

pub fn route_for(view: ViewId) -> &'static Route {
    ROUTES
        .iter()
        .find(|route| route.view == view)
        .unwrap_or(&ROUTES[0])
}

pub fn children(parent: ViewId) -> impl Iterator<Item = &'static Route> {
    ROUTES
        .iter()
        .filter(move |route| route.parent == Some(parent))
}

/// Resolves paths to loaded views. Eager views load up front, lazy ones on
/// first navigation; every view loads at most once.
pub struct ViewResolver<V> {
    loader: Box<dyn Fn(&Route) -> V + Send + Sync>,
    loaded: HashMap<ViewId, Arc<V>>,
}

impl<V> ViewResolver<V> {
    pub fn new<F>(loader: F) -> Self
    where
        F: Fn(&Route) -> V + Send + Sync + 'static,
    {
        let mut resolver = Self {
            loader: Box::new(loader),
            loaded: HashMap::new(),
        };
        for route in ROUTES.iter().filter(|r| r.load == LoadMode::Eager) {
            resolver.load(route);
        }
        resolver
    }

    pub fn resolve(&mut self, path: &str) -> Option<(&'static Route, Arc<V>)> {
        let route = resolve(path)?;
        Some((route, self.load(route)))
    }

    #[cfg(test)]
    pub fn is_loaded(&self, view: ViewId) -> bool {
        self.loaded.contains_key(&view)
    }

    fn load(&mut self, route: &'static Route) -> Arc<V> {
        if let Some(view) = self.loaded.get(&route.view) {
            return view.clone();
        }
        tracing::debug!(route = route.name, "loading view");
        let view = Arc::new((self.loader)(route));
        self.loaded.insert(route.view, view.clone());
        view
    }
}
