use kiln::{Environment, MemoryLoader};
use rand::Rng;

/// An environment whose loader serves `templates`.
pub fn get_env(templates: &[(&str, &str)]) -> Environment {
    get_env_with(Environment::builder(), templates)
}

pub fn get_env_with(builder: kiln::EnvironmentBuilder, templates: &[(&str, &str)]) -> Environment {
    let mut loader = MemoryLoader::new();
    for (name, source) in templates {
        loader.insert(*name, *source);
    }
    builder.loader(loader).build()
}

pub fn generate_random_whitespace() -> String {
    let mut rng = rand::rng();
    let length = rng.random_range(0..10);
    (0..length).map(|_| ' ').collect()
}

pub fn generate_random_whitespace_at_least_one() -> String {
    let mut rng = rand::rng();
    let length = rng.random_range(1..10);
    (0..length).map(|_| ' ').collect()
}
