//! Prompt to R code expansion
//!
//! The pool consumes a [`CodeGenerator`] to turn a natural-language prompt
//! into code. [`TemplateGenerator`] is a keyword matcher over a handful of
//! canned analyses; anything smarter plugs in behind the same trait.

use crate::dataset::{DEFAULT_DATA_VARIABLE, column_names, numeric_columns, r_string_literal};
use crate::types::Row;

/// Turns a prompt plus a dataset into R code
pub trait CodeGenerator: Send + Sync {
    /// Generate code for `prompt`. The dataset is bound to `data` when the
    /// code runs.
    fn generate(&self, prompt: &str, rows: &[Row]) -> String;
}

/// The canned analyses [`TemplateGenerator`] knows about
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Template {
    /// Correlation matrix over the numeric columns
    Correlation { columns: Vec<String> },
    /// Scatter plot of two columns with a linear trend
    Scatter { x: String, y: String },
    /// Distribution of one numeric column
    Histogram { column: String },
    /// Summary statistics, structure and missing values
    Summary,
}

impl Template {
    /// Pick a template by keyword, falling back to a summary when the
    /// dataset lacks the columns a plot needs
    pub fn select(prompt: &str, rows: &[Row]) -> Self {
        let prompt = prompt.to_lowercase();

        if prompt.contains("correlation") {
            let columns = numeric_columns(rows);
            if columns.len() >= 2 {
                return Template::Correlation { columns };
            }
        }

        if prompt.contains("scatter") {
            let mut columns = column_names(rows).into_iter();
            if let (Some(x), Some(y)) = (columns.next(), columns.next()) {
                return Template::Scatter { x, y };
            }
        }

        if prompt.contains("histogram")
            && let Some(column) = numeric_columns(rows).into_iter().next()
        {
            return Template::Histogram { column };
        }

        Template::Summary
    }

    /// Render the template as R code
    pub fn render(&self) -> String {
        let data = DEFAULT_DATA_VARIABLE;
        match self {
            Template::Correlation { columns } => {
                let quoted: Vec<String> = columns.iter().map(|c| r_string_literal(c)).collect();
                format!(
                    r#"library(corrplot)
cor_matrix <- cor({data}[, c({columns})], use = "complete.obs")
print(round(cor_matrix, 2))
corrplot(cor_matrix, method = "circle", type = "upper",
         order = "hclust", tl.cex = 0.8, tl.col = "black",
         title = "Correlation Matrix", mar = c(0, 0, 1, 0))
"#,
                    columns = quoted.join(", ")
                )
            }
            Template::Scatter { x, y } => format!(
                r#"library(ggplot2)
p <- ggplot({data}, aes(x = {x}, y = {y})) +
  geom_point(alpha = 0.7, size = 3) +
  geom_smooth(method = "lm", se = TRUE, color = "blue") +
  theme_minimal() +
  labs(title = paste("Scatter Plot:", {x_label}, "vs", {y_label}),
       x = {x_label}, y = {y_label})
print(p)
"#,
                x_label = r_string_literal(x),
                y_label = r_string_literal(y)
            ),
            Template::Histogram { column } => format!(
                r#"library(ggplot2)
p <- ggplot({data}, aes(x = {column})) +
  geom_histogram(aes(y = after_stat(density)), bins = 30,
                 fill = "lightblue", color = "black", alpha = 0.7) +
  geom_density(color = "red", linewidth = 1) +
  theme_minimal() +
  labs(title = paste("Distribution of", {label}),
       x = {label}, y = "Density")
print(p)
"#,
                label = r_string_literal(column)
            ),
            Template::Summary => format!(
                r#"cat("Data Summary:\n")
cat("============\n")
print(summary({data}))
cat("\nData Structure:\n")
cat("===============\n")
str({data})
cat("\nMissing Values:\n")
cat("===============\n")
print(colSums(is.na({data})))
"#
            ),
        }
    }
}

/// Keyword-driven template expansion
#[derive(Debug, Clone, Copy, Default)]
pub struct TemplateGenerator;

impl CodeGenerator for TemplateGenerator {
    fn generate(&self, prompt: &str, rows: &[Row]) -> String {
        Template::select(prompt, rows).render()
    }
}
