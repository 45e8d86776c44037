//! Declarations the registry ingests.
//!
//! Turning declaration documents into these values is the job of a
//! [`DeclarationParser`] supplied by the host; the registry only consumes the
//! result.

use crate::objects::ContributorId;

/// One node of an extension's content tree.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtensionDescription {
	pub name: String,
	pub properties: Vec<(String, String)>,
	pub value: Option<String>,
	pub children: Vec<ExtensionDescription>,
}

impl ExtensionDescription {
	pub fn new(name: impl Into<String>) -> Self {
		Self {
			name: name.into(),
			..Self::default()
		}
	}

	pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
		self.properties.push((key.into(), value.into()));
		self
	}

	pub fn with_value(mut self, value: impl Into<String>) -> Self {
		self.value = Some(value.into());
		self
	}

	pub fn with_child(mut self, child: ExtensionDescription) -> Self {
		self.children.push(child);
		self
	}
}

/// An extension point as declared by its contributor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtensionPointDecl {
	/// Local id; qualified with the contributor's namespace on ingestion.
	pub local_id: String,
	pub label: String,
	pub schema: Option<String>,
}

impl ExtensionPointDecl {
	pub fn new(local_id: impl Into<String>) -> Self {
		Self {
			local_id: local_id.into(),
			..Self::default()
		}
	}

	pub fn with_label(mut self, label: impl Into<String>) -> Self {
		self.label = label.into();
		self
	}

	pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
		self.schema = Some(schema.into());
		self
	}
}

/// An extension as declared by its contributor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtensionDecl {
	/// Local id. Anonymous extensions have none and cannot be looked up by id.
	pub local_id: Option<String>,
	pub label: String,
	/// Target point; a value without `.` is qualified with the contributor's namespace.
	pub target: String,
	pub content: Vec<ExtensionDescription>,
}

impl ExtensionDecl {
	pub fn new(target: impl Into<String>) -> Self {
		Self {
			target: target.into(),
			..Self::default()
		}
	}

	pub fn with_id(mut self, local_id: impl Into<String>) -> Self {
		self.local_id = Some(local_id.into());
		self
	}

	pub fn with_label(mut self, label: impl Into<String>) -> Self {
		self.label = label.into();
		self
	}

	pub fn with_content(mut self, element: ExtensionDescription) -> Self {
		self.content.push(element);
		self
	}
}

/// Everything one contributor supplies in a single write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Declaration {
	pub contributor: ContributorId,
	pub extension_points: Vec<ExtensionPointDecl>,
	pub extensions: Vec<ExtensionDecl>,
}

impl Declaration {
	pub fn new(contributor: ContributorId) -> Self {
		Self {
			contributor,
			extension_points: Vec::new(),
			extensions: Vec::new(),
		}
	}

	pub fn with_extension_point(mut self, point: ExtensionPointDecl) -> Self {
		self.extension_points.push(point);
		self
	}

	pub fn with_extension(mut self, extension: ExtensionDecl) -> Self {
		self.extensions.push(extension);
		self
	}
}

/// Problems a parser found in a declaration document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParseReport {
	pub problems: Vec<String>,
}

impl ParseReport {
	pub fn single(problem: impl Into<String>) -> Self {
		Self {
			problems: vec![problem.into()],
		}
	}
}

/// Turns raw declaration documents into [`Declaration`]s.
pub trait DeclarationParser {
	fn parse(&self, contributor: ContributorId, source: &[u8], source_name: &str) -> Result<Declaration, ParseReport>;
}

impl<F> DeclarationParser for F
where
	F: Fn(ContributorId, &[u8], &str) -> Result<Declaration, ParseReport>,
{
	fn parse(&self, contributor: ContributorId, source: &[u8], source_name: &str) -> Result<Declaration, ParseReport> {
		self(contributor, source, source_name)
	}
}
