use crate::config::ConfigDoc;
use crate::error::Result;
use crate::planner::Plan;

pub mod build;
pub mod core;
pub mod kernel;
pub mod package;
pub mod resources;
pub mod util;

pub trait Module {
    fn id(&self) -> &'static str;
    fn detect(&self, doc: &ConfigDoc) -> bool;
    fn plan(&self, doc: &ConfigDoc, plan: &mut Plan) -> Result<()>;
}

pub fn builtin_modules() -> Vec<Box<dyn Module>> {
    vec![
        Box::new(core::CoreModule),
        Box::new(resources::ResourcesModule),
        Box::new(kernel::KernelModule),
        Box::new(build::BuildModule),
        Box::new(package::PackageModule),
    ]
}
