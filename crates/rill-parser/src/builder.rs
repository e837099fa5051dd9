//! Pest-based compiler front end for RillQL
//!
//! The grammar in `rillql.pest` produces the concrete syntax tree; the
//! [`AstBuilder`] walks it top-down, building each node from its
//! already-built children. The stream scope is consulted for the
//! context-sensitive cases the grammar cannot decide on its own, most
//! importantly whether `#name` is an inner-stream reference or a
//! function reference.

use pest::Parser;
use pest_derive::Parser;

use crate::error::{CompileError, ParseResult};
use crate::scope::StreamScope;
use crate::time;
use rill_core::ast::*;

/// Extension trait for safer iterator extraction
trait IteratorExt<'a> {
    /// Get the next element or fail with the expected rule description
    fn expect_next(&mut self, expected: &str) -> ParseResult<pest::iterators::Pair<'a, Rule>>;
}

impl<'a> IteratorExt<'a> for pest::iterators::Pairs<'a, Rule> {
    fn expect_next(&mut self, expected: &str) -> ParseResult<pest::iterators::Pair<'a, Rule>> {
        self.next()
            .ok_or_else(|| CompileError::MissingNode(expected.to_string()))
    }
}

#[derive(Parser)]
#[grammar = "rillql.pest"]
pub struct RillParser;

/// Compile a RillQL source string into an execution plan.
pub fn parse(source: &str) -> ParseResult<ExecutionPlan> {
    let mut pairs =
        RillParser::parse(Rule::execution_plan, source).map_err(convert_pest_error)?;
    let root = pairs.expect_next("execution plan")?;
    AstBuilder::default().build_plan(root)
}

fn convert_pest_error(e: pest::error::Error<Rule>) -> CompileError {
    let (line, column) = match e.line_col {
        pest::error::LineColLocation::Pos((l, c)) => (l, c),
        pest::error::LineColLocation::Span((l, c), _) => (l, c),
    };

    let message = match &e.variant {
        pest::error::ErrorVariant::ParsingError {
            positives,
            negatives: _,
        } => {
            if positives.is_empty() {
                "unexpected token".to_string()
            } else {
                let expected: Vec<String> = positives.iter().map(format_rule_name).collect();
                if expected.len() == 1 {
                    format!("expected {}", expected[0])
                } else {
                    format!("expected one of: {}", expected.join(", "))
                }
            }
        }
        pest::error::ErrorVariant::CustomError { message } => message.clone(),
    };

    CompileError::Syntax {
        line,
        column,
        message,
    }
}

/// Convert pest rule names to a human-readable format
fn format_rule_name(rule: &Rule) -> String {
    match rule {
        Rule::ident => "identifier".to_string(),
        Rule::source => "stream name".to_string(),
        Rule::expression | Rule::or_expr => "expression".to_string(),
        Rule::attribute_type => "type (string, int, long, float, double, bool, object)".to_string(),
        Rule::attribute_def => "attribute declaration (name type)".to_string(),
        Rule::query_output => "output clause (insert/delete/update/return)".to_string(),
        Rule::time_value => "time value".to_string(),
        Rule::time_unit => "time unit (sec, min, hour, ...)".to_string(),
        Rule::string_literal => "string".to_string(),
        Rule::int_literal => "number".to_string(),
        Rule::count_bounds => "count bounds (<min:max>)".to_string(),
        Rule::equality_op => "operator (==, !=)".to_string(),
        Rule::compare_op => "operator (<, >, <=, >=)".to_string(),
        Rule::additive_op => "operator (+, -)".to_string(),
        Rule::multiplicative_op => "operator (*, /, %)".to_string(),
        _ => format!("{:?}", rule).to_lowercase().replace('_', " "),
    }
}

fn location(pair: &pest::iterators::Pair<Rule>) -> (usize, usize) {
    pair.as_span().start_pos().line_col()
}

fn semantic_error(pair: &pest::iterators::Pair<Rule>, message: impl Into<String>) -> CompileError {
    let (line, column) = location(pair);
    let fragment: String = pair.as_str().trim().chars().take(48).collect();
    CompileError::Semantic {
        line,
        column,
        fragment,
        message: message.into(),
    }
}

fn unquote(text: &str) -> &str {
    let t = text.trim();
    t.get(1..t.len().saturating_sub(1)).unwrap_or(t)
}

/// Walks the parse tree, threading the stream scope through the
/// traversal. One builder instance compiles one plan.
#[derive(Default)]
struct AstBuilder {
    scope: StreamScope,
}

impl AstBuilder {
    fn build_plan(mut self, pair: pest::iterators::Pair<Rule>) -> ParseResult<ExecutionPlan> {
        let mut plan = ExecutionPlan::default();

        for item in pair.into_inner() {
            match item.as_rule() {
                Rule::plan_annotation => {
                    plan.annotations.push(self.build_plan_annotation(item)?)
                }
                Rule::definition_stream => {
                    let ctx = item.clone();
                    let def = self.build_stream_definition(item)?;
                    if plan.stream_definitions.contains_key(&def.id) {
                        return Err(semantic_error(
                            &ctx,
                            format!("stream '{}' is already defined", def.id),
                        ));
                    }
                    plan.stream_definitions.insert(def.id.clone(), def);
                }
                Rule::definition_table => {
                    let ctx = item.clone();
                    let def = self.build_table_definition(item)?;
                    if plan.table_definitions.contains_key(&def.id) {
                        return Err(semantic_error(
                            &ctx,
                            format!("table '{}' is already defined", def.id),
                        ));
                    }
                    plan.table_definitions.insert(def.id.clone(), def);
                }
                Rule::definition_function => {
                    let ctx = item.clone();
                    let def = self.build_function_definition(item)?;
                    if plan.function_definitions.contains_key(&def.id) {
                        return Err(semantic_error(
                            &ctx,
                            format!("function '{}' is already defined", def.id),
                        ));
                    }
                    plan.function_definitions.insert(def.id.clone(), def);
                }
                Rule::query => plan
                    .execution_elements
                    .push(ExecutionElement::Query(self.build_query(item)?)),
                Rule::partition => plan
                    .execution_elements
                    .push(ExecutionElement::Partition(self.build_partition(item)?)),
                Rule::EOI => {}
                other => {
                    return Err(CompileError::MissingNode(format!(
                        "top-level statement, found {:?}",
                        other
                    )))
                }
            }
        }

        Ok(plan)
    }

    // ------------------------------------------------------------------
    // Annotations
    // ------------------------------------------------------------------

    fn build_plan_annotation(
        &mut self,
        pair: pest::iterators::Pair<Rule>,
    ) -> ParseResult<Annotation> {
        let mut inner = pair.into_inner();
        let name = inner.expect_next("plan annotation name")?.as_str();
        let mut annotation = Annotation {
            name: format!("plan:{}", name),
            elements: Vec::new(),
        };
        for p in inner {
            annotation.elements.push(Self::build_annotation_element(p)?);
        }
        Ok(annotation)
    }

    fn build_annotation(pair: pest::iterators::Pair<Rule>) -> ParseResult<Annotation> {
        let mut inner = pair.into_inner();
        let name_pair = inner.expect_next("annotation name")?;
        let name = name_pair
            .into_inner()
            .map(|p| p.as_str())
            .collect::<Vec<_>>()
            .join(":");
        let mut annotation = Annotation {
            name,
            elements: Vec::new(),
        };
        for p in inner {
            annotation.elements.push(Self::build_annotation_element(p)?);
        }
        Ok(annotation)
    }

    fn build_annotation_element(
        pair: pest::iterators::Pair<Rule>,
    ) -> ParseResult<AnnotationElement> {
        let mut key = None;
        let mut value = String::new();
        for p in pair.into_inner() {
            match p.as_rule() {
                Rule::ident => key = Some(p.as_str().to_string()),
                Rule::string_literal => value = unquote(p.as_str()).to_string(),
                other => {
                    return Err(CompileError::MissingNode(format!(
                        "annotation element, found {:?}",
                        other
                    )))
                }
            }
        }
        Ok(AnnotationElement { key, value })
    }

    // ------------------------------------------------------------------
    // Definitions
    // ------------------------------------------------------------------

    fn build_stream_definition(
        &mut self,
        pair: pest::iterators::Pair<Rule>,
    ) -> ParseResult<StreamDefinition> {
        let (id, attributes, annotations) = self.build_definition_parts(pair, "stream")?;
        Ok(StreamDefinition {
            id,
            attributes,
            annotations,
        })
    }

    fn build_table_definition(
        &mut self,
        pair: pest::iterators::Pair<Rule>,
    ) -> ParseResult<TableDefinition> {
        let (id, attributes, annotations) = self.build_definition_parts(pair, "table")?;
        Ok(TableDefinition {
            id,
            attributes,
            annotations,
        })
    }

    fn build_definition_parts(
        &mut self,
        pair: pest::iterators::Pair<Rule>,
        kind: &str,
    ) -> ParseResult<(String, Vec<Attribute>, Vec<Annotation>)> {
        let mut annotations = Vec::new();
        let mut id = String::new();
        let mut attributes: Vec<Attribute> = Vec::new();

        for p in pair.into_inner() {
            match p.as_rule() {
                Rule::annotation => annotations.push(Self::build_annotation(p)?),
                Rule::kw_define | Rule::kw_stream | Rule::kw_table => {}
                Rule::source => {
                    if p.as_str().starts_with('#') {
                        return Err(semantic_error(
                            &p,
                            format!("a {} definition cannot use an inner stream name", kind),
                        ));
                    }
                    id = p.as_str().to_string();
                }
                Rule::attribute_def => {
                    let ctx = p.clone();
                    let attr = Self::build_attribute(p)?;
                    if attributes.iter().any(|a| a.name == attr.name) {
                        return Err(semantic_error(
                            &ctx,
                            format!("duplicate attribute '{}'", attr.name),
                        ));
                    }
                    attributes.push(attr);
                }
                other => {
                    return Err(CompileError::MissingNode(format!(
                        "definition clause, found {:?}",
                        other
                    )))
                }
            }
        }

        Ok((id, attributes, annotations))
    }

    fn build_attribute(pair: pest::iterators::Pair<Rule>) -> ParseResult<Attribute> {
        let mut inner = pair.into_inner();
        let name = inner.expect_next("attribute name")?.as_str().to_string();
        let ty = Self::build_attribute_type(inner.expect_next("attribute type")?)?;
        Ok(Attribute { name, ty })
    }

    fn build_attribute_type(pair: pest::iterators::Pair<Rule>) -> ParseResult<AttributeType> {
        let ty = match pair.as_str().to_ascii_lowercase().as_str() {
            "string" => AttributeType::String,
            "int" => AttributeType::Int,
            "long" => AttributeType::Long,
            "float" => AttributeType::Float,
            "double" => AttributeType::Double,
            "bool" => AttributeType::Bool,
            "object" => AttributeType::Object,
            other => return Err(semantic_error(&pair, format!("unknown type '{}'", other))),
        };
        Ok(ty)
    }

    fn build_function_definition(
        &mut self,
        pair: pest::iterators::Pair<Rule>,
    ) -> ParseResult<FunctionDefinition> {
        let mut inner = pair.into_inner();
        let _define = inner.expect_next("define keyword")?;
        let _function = inner.expect_next("function keyword")?;
        let id = inner.expect_next("function name")?.as_str().to_string();
        let language = inner.expect_next("script language")?.as_str().to_string();
        let _return = inner.expect_next("return keyword")?;
        let return_type = Self::build_attribute_type(inner.expect_next("return type")?)?;
        let body_pair = inner.expect_next("script body")?;
        let body = unquote(body_pair.as_str()).trim().to_string();
        Ok(FunctionDefinition {
            id,
            language,
            return_type,
            body,
        })
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// The scope is cleared when the query ends, whether or not it built.
    fn build_query(&mut self, pair: pest::iterators::Pair<Rule>) -> ParseResult<Query> {
        let result = self.build_query_parts(pair.into_inner());
        self.scope.clear();
        result
    }

    fn build_query_parts(
        &mut self,
        pairs: pest::iterators::Pairs<Rule>,
    ) -> ParseResult<Query> {
        let mut annotations = Vec::new();
        let mut input: Option<InputStream> = None;
        let mut selector = Selector::default();
        let mut output_rate = None;
        let mut output: Option<OutputStream> = None;

        for p in pairs {
            match p.as_rule() {
                Rule::annotation => annotations.push(Self::build_annotation(p)?),
                Rule::kw_from => {}
                Rule::standard_stream => {
                    input = Some(InputStream::Single(self.build_standard_stream(p)?))
                }
                Rule::join_stream => {
                    input = Some(InputStream::Join(Box::new(self.build_join_stream(p)?)))
                }
                Rule::pattern_stream => {
                    input = Some(InputStream::State(self.build_pattern_stream(p)?))
                }
                Rule::sequence_stream => {
                    input = Some(InputStream::State(self.build_sequence_stream(p)?))
                }
                Rule::anonymous_stream => {
                    input = Some(InputStream::Anonymous(Box::new(
                        self.build_anonymous_stream(p)?,
                    )))
                }
                Rule::query_section => selector = self.build_selector(p)?,
                Rule::output_rate => output_rate = Some(self.build_output_rate(p)?),
                Rule::query_output => output = Some(self.build_query_output(p)?),
                other => {
                    return Err(CompileError::MissingNode(format!(
                        "query clause, found {:?}",
                        other
                    )))
                }
            }
        }

        let input = input.ok_or_else(|| CompileError::MissingNode("query input".to_string()))?;
        // Nested queries without an explicit output clause return their
        // current events to the enclosing query.
        let output = output.unwrap_or(OutputStream::Return {
            event_type: OutputEventType::CurrentEvents,
        });

        Ok(Query {
            annotations,
            input,
            selector,
            output_rate,
            output,
        })
    }

    /// Nested queries get a fresh scope; the enclosing one is restored
    /// afterwards, success or not.
    fn build_anonymous_stream(
        &mut self,
        pair: pest::iterators::Pair<Rule>,
    ) -> ParseResult<Query> {
        let saved = std::mem::take(&mut self.scope);
        let result = self.build_query_parts(pair.into_inner());
        self.scope = saved;
        result
    }

    // ------------------------------------------------------------------
    // Input streams
    // ------------------------------------------------------------------

    fn build_standard_stream(
        &mut self,
        pair: pest::iterators::Pair<Rule>,
    ) -> ParseResult<SingleInputStream> {
        let mut inner = pair.into_inner();
        let source = inner.expect_next("stream source")?;
        let raw = source.as_str();
        let is_inner = raw.starts_with('#');
        self.scope.declare(raw);

        let mut stream =
            SingleInputStream::new(raw.trim_start_matches('#').to_string(), is_inner);

        let mut after_window = false;
        for p in inner {
            match p.as_rule() {
                Rule::filter => {
                    let expr = self.build_filter(p)?;
                    let handler = StreamHandler::Filter(expr);
                    if after_window {
                        stream.post_window_handlers.push(handler);
                    } else {
                        stream.pre_window_handlers.push(handler);
                    }
                }
                Rule::stream_function => {
                    let call = self.build_stream_function(p)?;
                    let handler = StreamHandler::Function(call);
                    if after_window {
                        stream.post_window_handlers.push(handler);
                    } else {
                        stream.pre_window_handlers.push(handler);
                    }
                }
                Rule::window => {
                    stream.window = Some(self.build_window(p)?);
                    after_window = true;
                }
                other => {
                    return Err(CompileError::MissingNode(format!(
                        "stream handler, found {:?}",
                        other
                    )))
                }
            }
        }

        Ok(stream)
    }

    fn build_filter(&mut self, pair: pest::iterators::Pair<Rule>) -> ParseResult<Expression> {
        let mut inner = pair.into_inner();
        self.build_expression(inner.expect_next("filter expression")?)
    }

    fn build_stream_function(
        &mut self,
        pair: pest::iterators::Pair<Rule>,
    ) -> ParseResult<FunctionCall> {
        let mut inner = pair.into_inner();
        self.build_function_operation(inner.expect_next("stream function")?)
    }

    fn build_window(&mut self, pair: pest::iterators::Pair<Rule>) -> ParseResult<FunctionCall> {
        for p in pair.into_inner() {
            if p.as_rule() == Rule::function_operation {
                return self.build_function_operation(p);
            }
        }
        Err(CompileError::MissingNode("window function".to_string()))
    }

    fn build_join_stream(
        &mut self,
        pair: pest::iterators::Pair<Rule>,
    ) -> ParseResult<JoinInputStream> {
        let ctx = pair.clone();
        let mut inner = pair.into_inner();

        let (left, left_unidirectional) =
            self.build_join_source(inner.expect_next("left join source")?)?;

        let type_pair = inner.expect_next("join type")?;
        let join_type = Self::build_join_type(&type_pair)?;

        let (right, right_unidirectional) =
            self.build_join_source(inner.expect_next("right join source")?)?;

        let mut on = None;
        let mut within = None;
        for p in inner {
            match p.as_rule() {
                Rule::kw_on => {}
                Rule::expression => on = Some(self.build_expression(p)?),
                Rule::within_time => within = Some(self.build_within(p)?),
                other => {
                    return Err(CompileError::MissingNode(format!(
                        "join clause, found {:?}",
                        other
                    )))
                }
            }
        }

        let trigger = match (left_unidirectional, right_unidirectional) {
            (true, true) => {
                return Err(semantic_error(
                    &ctx,
                    "both sides of a join cannot be unidirectional",
                ))
            }
            (true, false) => JoinTrigger::Right,
            (false, true) => JoinTrigger::Left,
            (false, false) => JoinTrigger::All,
        };

        Ok(JoinInputStream {
            left,
            join_type,
            right,
            on,
            trigger,
            within,
        })
    }

    fn build_join_type(type_pair: &pest::iterators::Pair<Rule>) -> ParseResult<JoinType> {
        let mut outer = false;
        for p in type_pair.clone().into_inner() {
            match p.as_rule() {
                Rule::kw_left | Rule::kw_right | Rule::kw_full | Rule::kw_outer => outer = true,
                Rule::kw_inner | Rule::kw_join => {}
                other => {
                    return Err(CompileError::MissingNode(format!(
                        "join keyword, found {:?}",
                        other
                    )))
                }
            }
        }
        if outer {
            return Err(semantic_error(type_pair, "outer joins are not supported"));
        }
        Ok(JoinType::Inner)
    }

    fn build_join_source(
        &mut self,
        pair: pest::iterators::Pair<Rule>,
    ) -> ParseResult<(SingleInputStream, bool)> {
        let mut inner = pair.into_inner();
        let mut stream = self.build_standard_stream(inner.expect_next("join source stream")?)?;
        let mut unidirectional = false;

        for p in inner {
            match p.as_rule() {
                Rule::kw_as => {}
                Rule::ident => {
                    // The alias replaces the raw source name in scope.
                    let raw = if stream.is_inner_stream {
                        format!("#{}", stream.stream_id)
                    } else {
                        stream.stream_id.clone()
                    };
                    self.scope.remove(&raw);
                    self.scope.declare(p.as_str());
                    stream.alias = Some(p.as_str().to_string());
                }
                Rule::kw_unidirectional => unidirectional = true,
                other => {
                    return Err(CompileError::MissingNode(format!(
                        "join source clause, found {:?}",
                        other
                    )))
                }
            }
        }

        Ok((stream, unidirectional))
    }

    // ------------------------------------------------------------------
    // Patterns and sequences
    // ------------------------------------------------------------------

    fn build_pattern_stream(
        &mut self,
        pair: pest::iterators::Pair<Rule>,
    ) -> ParseResult<StateInputStream> {
        let mut inner = pair.into_inner();
        let state = self.build_pattern_chain(inner.expect_next("pattern chain")?)?;
        Ok(StateInputStream {
            kind: StateKind::Pattern,
            state,
        })
    }

    fn build_pattern_chain(
        &mut self,
        pair: pest::iterators::Pair<Rule>,
    ) -> ParseResult<StateElement> {
        let mut inner = pair.into_inner();
        let mut element = self.build_pattern_element(inner.expect_next("pattern element")?)?;
        while let Some(p) = inner.next() {
            match p.as_rule() {
                Rule::arrow => {
                    let next =
                        self.build_pattern_element(inner.expect_next("pattern element")?)?;
                    element = StateElement::new(StateElementKind::Next {
                        first: Box::new(element),
                        second: Box::new(next),
                    });
                }
                other => {
                    return Err(CompileError::MissingNode(format!(
                        "'->', found {:?}",
                        other
                    )))
                }
            }
        }
        Ok(element)
    }

    fn build_pattern_element(
        &mut self,
        pair: pest::iterators::Pair<Rule>,
    ) -> ParseResult<StateElement> {
        let mut every = false;
        let mut element: Option<StateElement> = None;
        let mut within: Option<TimeConstant> = None;

        for p in pair.into_inner() {
            match p.as_rule() {
                Rule::kw_every => every = true,
                Rule::pattern_chain => element = Some(self.build_pattern_chain(p)?),
                Rule::pattern_leaf => element = Some(self.build_pattern_leaf(p)?),
                Rule::within_time => within = Some(self.build_within(p)?),
                other => {
                    return Err(CompileError::MissingNode(format!(
                        "pattern element, found {:?}",
                        other
                    )))
                }
            }
        }

        let mut element =
            element.ok_or_else(|| CompileError::MissingNode("pattern element".to_string()))?;
        if every {
            // `every (...) within t` bounds the repetition wrapper
            element = StateElement::new(StateElementKind::Every(Box::new(element)));
        }
        if within.is_some() {
            element.within = within;
        }
        Ok(element)
    }

    fn build_pattern_leaf(
        &mut self,
        pair: pest::iterators::Pair<Rule>,
    ) -> ParseResult<StateElement> {
        let mut inner = pair.into_inner();
        let first = inner.expect_next("pattern leaf")?;

        if first.as_rule() == Rule::kw_not {
            let absent = self.build_pattern_event(inner.expect_next("absent event")?)?;
            let mut present = None;
            for p in inner {
                match p.as_rule() {
                    Rule::kw_and => {}
                    Rule::pattern_event => present = Some(self.build_pattern_event(p)?),
                    other => {
                        return Err(CompileError::MissingNode(format!(
                            "'and' operand, found {:?}",
                            other
                        )))
                    }
                }
            }
            let kind = match present {
                Some(present) => StateElementKind::NotAnd { absent, present },
                None => StateElementKind::Not(absent),
            };
            return Ok(StateElement::new(kind));
        }

        let left = self.build_pattern_event(first)?;
        let Some(tail) = inner.next() else {
            return Ok(StateElement::new(StateElementKind::Stream(left)));
        };

        let kind = match tail.as_rule() {
            Rule::kw_and => {
                let right = self.build_pattern_event(inner.expect_next("'and' operand")?)?;
                StateElementKind::And { left, right }
            }
            Rule::kw_or => {
                let right = self.build_pattern_event(inner.expect_next("'or' operand")?)?;
                StateElementKind::Or { left, right }
            }
            Rule::count_bounds => {
                let (min, max) = Self::build_count_bounds(tail)?;
                StateElementKind::Count {
                    stream: left,
                    min,
                    max,
                }
            }
            Rule::zero_or_more => StateElementKind::Count {
                stream: left,
                min: Some(0),
                max: None,
            },
            Rule::one_or_more => StateElementKind::Count {
                stream: left,
                min: Some(1),
                max: None,
            },
            Rule::zero_or_one => StateElementKind::Count {
                stream: left,
                min: Some(0),
                max: Some(1),
            },
            other => {
                return Err(CompileError::MissingNode(format!(
                    "pattern operator, found {:?}",
                    other
                )))
            }
        };
        Ok(StateElement::new(kind))
    }

    fn build_pattern_event(
        &mut self,
        pair: pest::iterators::Pair<Rule>,
    ) -> ParseResult<SingleInputStream> {
        let mut alias: Option<String> = None;
        let mut stream: Option<SingleInputStream> = None;
        let mut handlers: Vec<StreamHandler> = Vec::new();

        for p in pair.into_inner() {
            match p.as_rule() {
                Rule::event_id => alias = Some(p.as_str().to_string()),
                Rule::source => {
                    let raw = p.as_str();
                    let is_inner = raw.starts_with('#');
                    self.scope.declare(raw);
                    stream = Some(SingleInputStream::new(
                        raw.trim_start_matches('#').to_string(),
                        is_inner,
                    ));
                }
                Rule::filter => handlers.push(StreamHandler::Filter(self.build_filter(p)?)),
                Rule::stream_function => {
                    handlers.push(StreamHandler::Function(self.build_stream_function(p)?))
                }
                other => {
                    return Err(CompileError::MissingNode(format!(
                        "pattern event, found {:?}",
                        other
                    )))
                }
            }
        }

        let mut stream =
            stream.ok_or_else(|| CompileError::MissingNode("event source".to_string()))?;
        stream.pre_window_handlers = handlers;

        if let Some(alias) = alias {
            // References later in the clause resolve to the alias, not
            // the raw source name.
            let raw = if stream.is_inner_stream {
                format!("#{}", stream.stream_id)
            } else {
                stream.stream_id.clone()
            };
            self.scope.remove(&raw);
            self.scope.declare(&alias);
            stream.alias = Some(alias);
        }

        Ok(stream)
    }

    fn build_count_bounds(
        pair: pest::iterators::Pair<Rule>,
    ) -> ParseResult<(Option<u32>, Option<u32>)> {
        let mut inner = pair.into_inner();
        let collect = inner.expect_next("count bounds")?;
        match collect.as_rule() {
            Rule::count_min_max => {
                let mut ints = collect.into_inner();
                let min = Self::parse_count(ints.expect_next("minimum count")?)?;
                let max = match ints.next() {
                    Some(p) => Some(Self::parse_count(p)?),
                    None => None,
                };
                Ok((Some(min), max))
            }
            Rule::count_max_only => {
                let max = Self::parse_count(collect.into_inner().expect_next("maximum count")?)?;
                Ok((None, Some(max)))
            }
            Rule::count_exact => {
                let n = Self::parse_count(collect.into_inner().expect_next("count")?)?;
                Ok((Some(n), Some(n)))
            }
            other => Err(CompileError::MissingNode(format!(
                "count bounds, found {:?}",
                other
            ))),
        }
    }

    fn parse_count(pair: pest::iterators::Pair<Rule>) -> ParseResult<u32> {
        pair.as_str()
            .parse()
            .map_err(|_| semantic_error(&pair, "count bound must be a non-negative integer"))
    }

    fn build_sequence_stream(
        &mut self,
        pair: pest::iterators::Pair<Rule>,
    ) -> ParseResult<StateInputStream> {
        let mut inner = pair.into_inner();

        let first = inner.expect_next("sequence element")?;
        let (every_first, first_element) = if first.as_rule() == Rule::kw_every {
            (true, inner.expect_next("sequence element")?)
        } else {
            (false, first)
        };

        let mut element = self.build_sequence_element(first_element)?;
        if every_first {
            element = StateElement::new(StateElementKind::Every(Box::new(element)));
        }
        for p in inner {
            let next = self.build_sequence_element(p)?;
            element = StateElement::new(StateElementKind::Next {
                first: Box::new(element),
                second: Box::new(next),
            });
        }

        Ok(StateInputStream {
            kind: StateKind::Sequence,
            state: element,
        })
    }

    fn build_sequence_element(
        &mut self,
        pair: pest::iterators::Pair<Rule>,
    ) -> ParseResult<StateElement> {
        let mut element: Option<StateElement> = None;
        let mut within: Option<TimeConstant> = None;

        for p in pair.into_inner() {
            match p.as_rule() {
                Rule::sequence_chain => element = Some(self.build_sequence_chain(p)?),
                Rule::sequence_leaf => element = Some(self.build_sequence_leaf(p)?),
                Rule::within_time => within = Some(self.build_within(p)?),
                other => {
                    return Err(CompileError::MissingNode(format!(
                        "sequence element, found {:?}",
                        other
                    )))
                }
            }
        }

        let mut element =
            element.ok_or_else(|| CompileError::MissingNode("sequence element".to_string()))?;
        if within.is_some() {
            element.within = within;
        }
        Ok(element)
    }

    fn build_sequence_chain(
        &mut self,
        pair: pest::iterators::Pair<Rule>,
    ) -> ParseResult<StateElement> {
        let mut inner = pair.into_inner();
        let mut element = self.build_sequence_element(inner.expect_next("sequence element")?)?;
        for p in inner {
            let next = self.build_sequence_element(p)?;
            element = StateElement::new(StateElementKind::Next {
                first: Box::new(element),
                second: Box::new(next),
            });
        }
        Ok(element)
    }

    fn build_sequence_leaf(
        &mut self,
        pair: pest::iterators::Pair<Rule>,
    ) -> ParseResult<StateElement> {
        // Same shape as a pattern leaf, plus the *, + and ? quantifiers.
        self.build_pattern_leaf(pair)
    }

    fn build_within(&mut self, pair: pest::iterators::Pair<Rule>) -> ParseResult<TimeConstant> {
        for p in pair.into_inner() {
            if p.as_rule() == Rule::time_value {
                return Ok(TimeConstant::millis(self.build_time_value(p)?));
            }
        }
        Err(CompileError::MissingNode("within time".to_string()))
    }

    // ------------------------------------------------------------------
    // Selection, rate limiting, output
    // ------------------------------------------------------------------

    fn build_selector(&mut self, pair: pest::iterators::Pair<Rule>) -> ParseResult<Selector> {
        let mut selector = Selector::default();

        for p in pair.into_inner() {
            match p.as_rule() {
                Rule::kw_select | Rule::select_all => {}
                Rule::output_attribute => {
                    selector.attributes.push(self.build_output_attribute(p)?)
                }
                Rule::group_by => {
                    for var_pair in p.into_inner() {
                        match var_pair.as_rule() {
                            Rule::kw_group | Rule::kw_by => {}
                            Rule::attribute_reference => {
                                let ctx = var_pair.clone();
                                match self.build_attribute_reference(var_pair)? {
                                    Expression::Variable(v) => selector.group_by.push(v),
                                    _ => {
                                        return Err(semantic_error(
                                            &ctx,
                                            "group by must reference an attribute",
                                        ))
                                    }
                                }
                            }
                            other => {
                                return Err(CompileError::MissingNode(format!(
                                    "group by attribute, found {:?}",
                                    other
                                )))
                            }
                        }
                    }
                }
                Rule::having_clause => {
                    let mut inner = p.into_inner();
                    let _having = inner.expect_next("having keyword")?;
                    selector.having =
                        Some(self.build_expression(inner.expect_next("having expression")?)?);
                }
                other => {
                    return Err(CompileError::MissingNode(format!(
                        "select clause, found {:?}",
                        other
                    )))
                }
            }
        }

        Ok(selector)
    }

    fn build_output_attribute(
        &mut self,
        pair: pest::iterators::Pair<Rule>,
    ) -> ParseResult<OutputAttribute> {
        let mut inner = pair.into_inner();
        let expr = self.build_expression(inner.expect_next("output expression")?)?;
        let mut alias = None;
        for p in inner {
            match p.as_rule() {
                Rule::kw_as => {}
                Rule::ident => alias = Some(p.as_str().to_string()),
                other => {
                    return Err(CompileError::MissingNode(format!(
                        "output alias, found {:?}",
                        other
                    )))
                }
            }
        }
        Ok(OutputAttribute { alias, expr })
    }

    fn build_output_rate(&mut self, pair: pest::iterators::Pair<Rule>) -> ParseResult<OutputRate> {
        let mut snapshot = false;
        let mut policy = OutputRatePolicy::All;
        let mut time_millis: Option<i64> = None;
        let mut event_count: Option<u64> = None;

        for p in pair.into_inner() {
            match p.as_rule() {
                Rule::kw_output | Rule::kw_every => {}
                Rule::kw_snapshot => snapshot = true,
                Rule::rate_policy => {
                    let kw = p.into_inner().expect_next("rate policy")?;
                    policy = match kw.as_rule() {
                        Rule::kw_all => OutputRatePolicy::All,
                        Rule::kw_first => OutputRatePolicy::First,
                        Rule::kw_last => OutputRatePolicy::Last,
                        other => {
                            return Err(CompileError::MissingNode(format!(
                                "rate policy, found {:?}",
                                other
                            )))
                        }
                    };
                }
                Rule::time_value => time_millis = Some(self.build_time_value(p)?),
                Rule::event_count => {
                    let int_pair = p.into_inner().expect_next("event count")?;
                    let count = int_pair
                        .as_str()
                        .parse()
                        .map_err(|_| semantic_error(&int_pair, "invalid event count"))?;
                    event_count = Some(count);
                }
                other => {
                    return Err(CompileError::MissingNode(format!(
                        "output rate clause, found {:?}",
                        other
                    )))
                }
            }
        }

        match (snapshot, time_millis, event_count) {
            (true, Some(millis), _) => Ok(OutputRate::Snapshot { millis }),
            (false, Some(millis), _) => Ok(OutputRate::Time { millis, policy }),
            (false, None, Some(count)) => Ok(OutputRate::Events { count, policy }),
            _ => Err(CompileError::MissingNode(
                "output rate magnitude".to_string(),
            )),
        }
    }

    fn build_query_output(
        &mut self,
        pair: pest::iterators::Pair<Rule>,
    ) -> ParseResult<OutputStream> {
        let mut inner = pair.into_inner();
        let head = inner.expect_next("output clause")?;

        match head.as_rule() {
            Rule::kw_insert => {
                let mut event_type = OutputEventType::CurrentEvents;
                let mut target = None;
                let mut is_inner = false;
                for p in inner {
                    match p.as_rule() {
                        Rule::output_event_type => event_type = Self::build_output_event_type(p)?,
                        Rule::kw_into => {}
                        Rule::target => {
                            let raw = p.as_str();
                            is_inner = raw.starts_with('#');
                            target = Some(raw.trim_start_matches('#').to_string());
                        }
                        other => {
                            return Err(CompileError::MissingNode(format!(
                                "insert clause, found {:?}",
                                other
                            )))
                        }
                    }
                }
                Ok(OutputStream::Insert {
                    target: target
                        .ok_or_else(|| CompileError::MissingNode("insert target".to_string()))?,
                    is_inner_stream: is_inner,
                    event_type,
                })
            }
            Rule::kw_delete | Rule::kw_update => {
                let deleting = head.as_rule() == Rule::kw_delete;
                let mut event_type = OutputEventType::CurrentEvents;
                let mut target = None;
                let mut condition = None;
                for p in inner {
                    match p.as_rule() {
                        Rule::target => {
                            if p.as_str().starts_with('#') {
                                let action = if deleting { "delete from" } else { "update" };
                                return Err(semantic_error(
                                    &p,
                                    format!("cannot {} an inner stream", action),
                                ));
                            }
                            target = Some(p.as_str().to_string());
                        }
                        Rule::kw_for | Rule::kw_on => {}
                        Rule::output_event_type => event_type = Self::build_output_event_type(p)?,
                        Rule::expression => condition = Some(self.build_expression(p)?),
                        other => {
                            return Err(CompileError::MissingNode(format!(
                                "output clause, found {:?}",
                                other
                            )))
                        }
                    }
                }
                let target = target
                    .ok_or_else(|| CompileError::MissingNode("output target".to_string()))?;
                let condition = condition
                    .ok_or_else(|| CompileError::MissingNode("on condition".to_string()))?;
                if deleting {
                    Ok(OutputStream::Delete {
                        target,
                        event_type,
                        condition,
                    })
                } else {
                    Ok(OutputStream::Update {
                        target,
                        event_type,
                        condition,
                    })
                }
            }
            Rule::kw_return => {
                let mut event_type = OutputEventType::CurrentEvents;
                for p in inner {
                    if p.as_rule() == Rule::output_event_type {
                        event_type = Self::build_output_event_type(p)?;
                    }
                }
                Ok(OutputStream::Return { event_type })
            }
            other => Err(CompileError::MissingNode(format!(
                "output clause, found {:?}",
                other
            ))),
        }
    }

    fn build_output_event_type(
        pair: pest::iterators::Pair<Rule>,
    ) -> ParseResult<OutputEventType> {
        let mut expired = false;
        let mut all = false;
        let mut raw = false;
        for p in pair.into_inner() {
            match p.as_rule() {
                Rule::kw_expired => expired = true,
                Rule::kw_all => all = true,
                Rule::kw_raw => raw = true,
                Rule::kw_current | Rule::kw_events => {}
                other => {
                    return Err(CompileError::MissingNode(format!(
                        "event type keyword, found {:?}",
                        other
                    )))
                }
            }
        }
        Ok(match (expired, all, raw) {
            (true, _, true) => OutputEventType::ExpiredRawEvents,
            (true, _, false) => OutputEventType::ExpiredEvents,
            (false, true, true) => OutputEventType::AllRawEvents,
            (false, true, false) => OutputEventType::AllEvents,
            (false, false, _) => OutputEventType::CurrentEvents,
        })
    }

    // ------------------------------------------------------------------
    // Partitions
    // ------------------------------------------------------------------

    fn build_partition(&mut self, pair: pest::iterators::Pair<Rule>) -> ParseResult<Partition> {
        let mut partition = Partition {
            annotations: Vec::new(),
            partition_types: Vec::new(),
            queries: Vec::new(),
        };

        for p in pair.into_inner() {
            match p.as_rule() {
                Rule::annotation => partition.annotations.push(Self::build_annotation(p)?),
                Rule::kw_partition | Rule::kw_with | Rule::kw_begin | Rule::kw_end => {}
                Rule::partition_with_stream => {
                    partition.partition_types.push(self.build_partition_with(p)?)
                }
                Rule::query => partition.queries.push(self.build_query(p)?),
                other => {
                    return Err(CompileError::MissingNode(format!(
                        "partition clause, found {:?}",
                        other
                    )))
                }
            }
        }

        Ok(partition)
    }

    /// Scope is scrubbed after each partition-with clause so its stream
    /// does not leak into the next clause or the partition's queries.
    fn build_partition_with(
        &mut self,
        pair: pest::iterators::Pair<Rule>,
    ) -> ParseResult<PartitionType> {
        let result = self.build_partition_with_parts(pair);
        self.scope.clear();
        result
    }

    fn build_partition_with_parts(
        &mut self,
        pair: pest::iterators::Pair<Rule>,
    ) -> ParseResult<PartitionType> {
        let pairs: Vec<_> = pair.into_inner().collect();

        // The stream comes into scope before its key expression builds.
        let source_pair = pairs
            .iter()
            .find(|p| p.as_rule() == Rule::source)
            .ok_or_else(|| CompileError::MissingNode("partition stream".to_string()))?
            .clone();
        let raw = source_pair.as_str();
        if raw.starts_with('#') {
            return Err(semantic_error(
                &source_pair,
                "cannot partition by an inner stream",
            ));
        }
        self.scope.declare(raw);
        let stream_id = raw.to_string();

        for p in pairs {
            match p.as_rule() {
                Rule::condition_ranges => {
                    let mut ranges = Vec::new();
                    for range_pair in p.into_inner() {
                        match range_pair.as_rule() {
                            Rule::kw_or => {}
                            Rule::condition_range => {
                                ranges.push(self.build_condition_range(range_pair)?)
                            }
                            other => {
                                return Err(CompileError::MissingNode(format!(
                                    "condition range, found {:?}",
                                    other
                                )))
                            }
                        }
                    }
                    return Ok(PartitionType::Range { stream_id, ranges });
                }
                Rule::expression => {
                    let expr = self.build_expression(p)?;
                    return Ok(PartitionType::Value { stream_id, expr });
                }
                Rule::kw_of | Rule::source => {}
                other => {
                    return Err(CompileError::MissingNode(format!(
                        "partition specifier, found {:?}",
                        other
                    )))
                }
            }
        }

        Err(CompileError::MissingNode(
            "partition range or value specifier".to_string(),
        ))
    }

    fn build_condition_range(
        &mut self,
        pair: pest::iterators::Pair<Rule>,
    ) -> ParseResult<RangePartition> {
        let mut inner = pair.into_inner();
        let condition = self.build_expression(inner.expect_next("range condition")?)?;
        let _as = inner.expect_next("as keyword")?;
        let label_pair = inner.expect_next("range label")?;
        Ok(RangePartition {
            condition,
            label: unquote(label_pair.as_str()).to_string(),
        })
    }

    // ------------------------------------------------------------------
    // Expressions
    // ------------------------------------------------------------------

    fn build_expression(
        &mut self,
        pair: pest::iterators::Pair<Rule>,
    ) -> ParseResult<Expression> {
        match pair.as_rule() {
            Rule::expression => {
                let mut inner = pair.into_inner();
                self.build_expression(inner.expect_next("expression")?)
            }
            Rule::or_expr
            | Rule::and_expr
            | Rule::equality_expr
            | Rule::compare_expr
            | Rule::additive_expr
            | Rule::multiplicative_expr => self.build_binary_chain(pair),
            Rule::in_expr => self.build_in_expr(pair),
            Rule::not_expr => self.build_not_expr(pair),
            Rule::basic_expr => self.build_basic_expr(pair),
            other => Err(CompileError::MissingNode(format!(
                "expression, found {:?}",
                other
            ))),
        }
    }

    /// Left-associative fold over one precedence layer.
    fn build_binary_chain(
        &mut self,
        pair: pest::iterators::Pair<Rule>,
    ) -> ParseResult<Expression> {
        let mut inner = pair.into_inner();
        let mut expr = self.build_expression(inner.expect_next("operand")?)?;

        while let Some(op_pair) = inner.next() {
            let op = Self::binary_op(&op_pair)?;
            let right = self.build_expression(inner.expect_next("right operand")?)?;
            expr = Expression::Binary {
                op,
                left: Box::new(expr),
                right: Box::new(right),
            };
        }
        Ok(expr)
    }

    fn binary_op(pair: &pest::iterators::Pair<Rule>) -> ParseResult<BinaryOp> {
        let op = match pair.as_rule() {
            Rule::kw_or => BinaryOp::Or,
            Rule::kw_and => BinaryOp::And,
            Rule::equality_op => match pair.as_str() {
                "==" => BinaryOp::Equal,
                _ => BinaryOp::NotEqual,
            },
            Rule::compare_op => match pair.as_str() {
                "<=" => BinaryOp::LessThanEqual,
                ">=" => BinaryOp::GreaterThanEqual,
                "<" => BinaryOp::LessThan,
                _ => BinaryOp::GreaterThan,
            },
            Rule::additive_op => match pair.as_str() {
                "+" => BinaryOp::Add,
                _ => BinaryOp::Subtract,
            },
            Rule::multiplicative_op => match pair.as_str() {
                "*" => BinaryOp::Multiply,
                "/" => BinaryOp::Divide,
                _ => BinaryOp::Mod,
            },
            other => {
                return Err(CompileError::MissingNode(format!(
                    "binary operator, found {:?}",
                    other
                )))
            }
        };
        Ok(op)
    }

    fn build_in_expr(&mut self, pair: pest::iterators::Pair<Rule>) -> ParseResult<Expression> {
        let mut inner = pair.into_inner();
        let expr = self.build_expression(inner.expect_next("operand")?)?;
        match inner.next() {
            None => Ok(expr),
            Some(_kw_in) => {
                let name = inner.expect_next("table name")?.as_str().to_string();
                Ok(Expression::In {
                    expr: Box::new(expr),
                    source_id: name,
                })
            }
        }
    }

    fn build_not_expr(&mut self, pair: pest::iterators::Pair<Rule>) -> ParseResult<Expression> {
        let mut inner = pair.into_inner();
        let first = inner.expect_next("expression")?;
        if first.as_rule() == Rule::kw_not {
            let operand = self.build_expression(inner.expect_next("negated expression")?)?;
            Ok(Expression::Not(Box::new(operand)))
        } else {
            self.build_expression(first)
        }
    }

    fn build_basic_expr(&mut self, pair: pest::iterators::Pair<Rule>) -> ParseResult<Expression> {
        let mut inner = pair.into_inner();
        let p = inner.expect_next("expression")?;
        match p.as_rule() {
            Rule::null_check => self.build_null_check(p),
            Rule::function_operation => Ok(Expression::Function(self.build_function_operation(p)?)),
            Rule::constant_value => Ok(Expression::Constant(self.build_constant(p)?)),
            Rule::attribute_reference => self.build_attribute_reference(p),
            Rule::expression => self.build_expression(p),
            other => Err(CompileError::MissingNode(format!(
                "expression, found {:?}",
                other
            ))),
        }
    }

    fn build_null_check(&mut self, pair: pest::iterators::Pair<Rule>) -> ParseResult<Expression> {
        let mut inner = pair.into_inner();
        let subject = inner.expect_next("null check subject")?;
        let ctx = subject.clone();

        let mut hash = false;
        let mut index = None;
        let mut names: Vec<String> = Vec::new();
        for p in subject.into_inner() {
            match p.as_rule() {
                Rule::hash => hash = true,
                Rule::ident => names.push(p.as_str().to_string()),
                Rule::attribute_index => index = Some(Self::build_attribute_index(p)?),
                other => {
                    return Err(CompileError::MissingNode(format!(
                        "null check subject, found {:?}",
                        other
                    )))
                }
            }
        }

        let check = match names.len() {
            // qualified attribute: `S.price is null`, `#Inner.price is null`
            2 => {
                let attribute = names.pop().unwrap_or_default();
                let name = names.pop().unwrap_or_default();
                NullCheck::Attribute(self.resolve_single_qualifier(hash, name, index, attribute))
            }
            1 => {
                let name = names.pop().unwrap_or_default();
                if hash {
                    NullCheck::InnerStream {
                        stream_id: name,
                        index,
                    }
                } else if self.scope.contains(&name) {
                    NullCheck::Stream {
                        stream_id: name,
                        index,
                    }
                } else if index.is_some() {
                    return Err(semantic_error(
                        &ctx,
                        "an indexed null check requires an active stream",
                    ));
                } else {
                    NullCheck::Attribute(Variable::attribute(name))
                }
            }
            _ => {
                return Err(CompileError::MissingNode(
                    "null check subject".to_string(),
                ))
            }
        };

        Ok(Expression::IsNull(check))
    }

    fn build_function_operation(
        &mut self,
        pair: pest::iterators::Pair<Rule>,
    ) -> ParseResult<FunctionCall> {
        let mut namespace = None;
        let mut name = String::new();
        let mut args = Vec::new();

        for p in pair.into_inner() {
            match p.as_rule() {
                Rule::function_namespace => {
                    let ns = p.into_inner().expect_next("function namespace")?;
                    namespace = Some(ns.as_str().to_string());
                }
                Rule::ident => name = p.as_str().to_string(),
                Rule::expression => args.push(self.build_expression(p)?),
                other => {
                    return Err(CompileError::MissingNode(format!(
                        "function argument, found {:?}",
                        other
                    )))
                }
            }
        }

        Ok(FunctionCall {
            namespace,
            name,
            args,
        })
    }

    fn build_attribute_reference(
        &mut self,
        pair: pest::iterators::Pair<Rule>,
    ) -> ParseResult<Expression> {
        let mut inner = pair.into_inner();
        let p = inner.expect_next("attribute reference")?;

        match p.as_rule() {
            Rule::ident => Ok(Expression::Variable(Variable::attribute(p.as_str()))),
            Rule::qualified_attribute => {
                let mut stream_qual: Option<(bool, String, Option<i32>)> = None;
                let mut function_qual: Option<(String, Option<i32>)> = None;
                let mut attribute = String::new();

                for part in p.into_inner() {
                    match part.as_rule() {
                        Rule::stream_qualifier => {
                            stream_qual = Some(Self::build_qualifier(part)?)
                        }
                        Rule::function_qualifier => {
                            let (_, name, index) = Self::build_qualifier(part)?;
                            function_qual = Some((name, index));
                        }
                        Rule::ident => attribute = part.as_str().to_string(),
                        other => {
                            return Err(CompileError::MissingNode(format!(
                                "attribute qualifier, found {:?}",
                                other
                            )))
                        }
                    }
                }

                let (hash, name, index) = stream_qual
                    .ok_or_else(|| CompileError::MissingNode("stream qualifier".to_string()))?;

                let variable = match function_qual {
                    Some((function_id, function_index)) => Variable {
                        stream_id: Some(name),
                        is_inner_stream: hash,
                        stream_index: index,
                        function_id: Some(function_id),
                        function_index,
                        attribute,
                    },
                    None => self.resolve_single_qualifier(hash, name, index, attribute),
                };
                Ok(Expression::Variable(variable))
            }
            other => Err(CompileError::MissingNode(format!(
                "attribute reference, found {:?}",
                other
            ))),
        }
    }

    fn build_qualifier(
        pair: pest::iterators::Pair<Rule>,
    ) -> ParseResult<(bool, String, Option<i32>)> {
        let mut hash = false;
        let mut name = String::new();
        let mut index = None;
        for p in pair.into_inner() {
            match p.as_rule() {
                Rule::hash => hash = true,
                Rule::ident => name = p.as_str().to_string(),
                Rule::attribute_index => index = Some(Self::build_attribute_index(p)?),
                other => {
                    return Err(CompileError::MissingNode(format!(
                        "qualifier, found {:?}",
                        other
                    )))
                }
            }
        }
        Ok((hash, name, index))
    }

    /// The canonical `#name` rule: presence in the active-stream set
    /// wins over the textual marker. A tracked `#name` is an inner
    /// stream; an untracked one names a function in the handler chain.
    fn resolve_single_qualifier(
        &self,
        hash: bool,
        name: String,
        index: Option<i32>,
        attribute: String,
    ) -> Variable {
        if hash {
            if self.scope.contains(&format!("#{}", name)) {
                Variable {
                    stream_id: Some(name),
                    is_inner_stream: true,
                    stream_index: index,
                    function_id: None,
                    function_index: None,
                    attribute,
                }
            } else {
                Variable {
                    stream_id: None,
                    is_inner_stream: false,
                    stream_index: None,
                    function_id: Some(name),
                    function_index: index,
                    attribute,
                }
            }
        } else {
            Variable {
                stream_id: Some(name),
                is_inner_stream: false,
                stream_index: index,
                function_id: None,
                function_index: None,
                attribute,
            }
        }
    }

    fn build_attribute_index(pair: pest::iterators::Pair<Rule>) -> ParseResult<i32> {
        let mut inner = pair.into_inner();
        let p = inner.expect_next("attribute index")?;
        match p.as_rule() {
            Rule::int_literal => p
                .as_str()
                .parse()
                .map_err(|_| semantic_error(&p, "invalid attribute index")),
            Rule::index_last => {
                // `last` is -1, `last - n` counts further back
                let mut offset = 0i32;
                for part in p.clone().into_inner() {
                    if part.as_rule() == Rule::int_literal {
                        offset = part
                            .as_str()
                            .parse()
                            .map_err(|_| semantic_error(&part, "invalid attribute index"))?;
                    }
                }
                Ok(-1 - offset)
            }
            other => Err(CompileError::MissingNode(format!(
                "attribute index, found {:?}",
                other
            ))),
        }
    }

    // ------------------------------------------------------------------
    // Literals
    // ------------------------------------------------------------------

    fn build_constant(&mut self, pair: pest::iterators::Pair<Rule>) -> ParseResult<Constant> {
        let mut inner = pair.into_inner();
        let p = inner.expect_next("literal")?;
        let constant = match p.as_rule() {
            Rule::time_value => Constant::Time(TimeConstant::millis(self.build_time_value(p)?)),
            Rule::string_literal => Constant::Str(unquote(p.as_str()).to_string()),
            Rule::bool_literal => Constant::Bool(p.as_str().eq_ignore_ascii_case("true")),
            Rule::float_literal => {
                let text = p.as_str();
                let digits = text.strip_suffix(['f', 'F']).unwrap_or(text);
                Constant::Float(
                    digits
                        .parse()
                        .map_err(|_| semantic_error(&p, "invalid float literal"))?,
                )
            }
            Rule::double_literal => Constant::Double(
                p.as_str()
                    .parse()
                    .map_err(|_| semantic_error(&p, "invalid double literal"))?,
            ),
            Rule::long_literal => Constant::Long(
                time::strip_long_suffix(p.as_str())
                    .parse()
                    .map_err(|_| semantic_error(&p, "invalid long literal"))?,
            ),
            Rule::int_literal => Constant::Int(
                p.as_str()
                    .parse()
                    .map_err(|_| semantic_error(&p, "integer literal out of range"))?,
            ),
            other => {
                return Err(CompileError::MissingNode(format!(
                    "literal, found {:?}",
                    other
                )))
            }
        };
        Ok(constant)
    }

    /// Sum the present components of a composite time literal.
    fn build_time_value(&mut self, pair: pest::iterators::Pair<Rule>) -> ParseResult<i64> {
        let ctx = pair.clone();
        let mut total: i64 = 0;

        for component in pair.into_inner() {
            let mut parts = component.into_inner();
            let amount_pair = parts.expect_next("time amount")?;
            let unit_pair = parts.expect_next("time unit")?;

            let amount: i64 = time::strip_long_suffix(amount_pair.as_str())
                .parse()
                .map_err(|_| semantic_error(&amount_pair, "invalid time amount"))?;
            let multiplier = time::unit_to_millis(unit_pair.as_str())
                .ok_or_else(|| semantic_error(&unit_pair, "unknown time unit"))?;

            total = amount
                .checked_mul(multiplier)
                .and_then(|v| total.checked_add(v))
                .ok_or_else(|| semantic_error(&ctx, "time value overflows"))?;
        }

        Ok(total)
    }
}
