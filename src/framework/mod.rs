//! Framework identifiers and the registry tying detectors to parsers
//!
//! The set of frameworks is closed: every [`TestFramework`] variant has a built-in
//! detector and parser, and the registry is a lookup table keyed by the variant.

mod id_enum_macro;
pub mod registry;

pub use registry::FrameworkRegistry;

crate::define_id_enum! {
    /// Test or analysis tool that produced a job trace
    TestFramework {
        Generic => "generic" : "Generic",
        Pytest => "pytest" : "pytest",
        DjangoPytest => "django-pytest" : "Django (pytest)" | "django",
        Jest => "jest" : "Jest",
        SonarQube => "sonarqube" : "SonarQube" | "sonar",
    }
}

impl Default for TestFramework {
    fn default() -> Self {
        Self::Generic
    }
}
