use thiserror::Error;

#[derive(Error, Debug)]
pub enum TemplateError {
    #[error("Template error: {0}")]
    Template(#[from] minijinja::Error),
}

pub type Result<T> = std::result::Result<T, TemplateError>;
